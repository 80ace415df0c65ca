//! 传输配置（TransportSettings）
//!
//! 消费者所需的全部传输参数：重试/退避、主机列表与凭据、队列声明标志、
//! 错误与审计队列名称、心跳以及故障转移的重连间隔。
//! 支持通过 serde 从配置文件加载，缺省字段取默认值。
//!
use crate::envelope::FieldTable;
use crate::error::{BusError, BusResult};
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 传输配置
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// 重新投递前的等待时间（毫秒），即重试队列的消息 TTL
    #[builder(default = 3000)]
    pub retry_delay_ms: u32,
    /// 最大重试次数
    #[builder(default = 3)]
    pub max_retries: u32,
    /// 逗号分隔的主机列表，按顺序轮转故障转移
    #[builder(default = "localhost".to_string(), into)]
    pub host: String,
    #[builder(into)]
    pub username: Option<String>,
    #[builder(into)]
    pub password: Option<String>,
    /// 写入 DestinationMachine 的本机名
    #[builder(default = default_machine_name(), into)]
    pub machine_name: String,
    #[builder(default = "errors".to_string(), into)]
    pub error_queue_name: String,
    #[builder(default = "audit".to_string(), into)]
    pub audit_queue_name: String,
    #[builder(default)]
    pub auditing_enabled: bool,
    /// 关闭后，超出重试上限的消息只记录日志，不再发布到错误交换机
    #[builder(default)]
    pub disable_errors: bool,
    #[builder(default)]
    pub client: ClientSettings,
    #[builder(default)]
    pub queue: QueueSettings,
    /// 连接丢失后的固定重连间隔（毫秒）
    #[builder(default = 10_000)]
    pub reconnect_interval_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl TransportSettings {
    /// 解析主机列表（去除空白与空项）
    pub fn hosts(&self) -> BusResult<Vec<String>> {
        let hosts: Vec<String> = self
            .host
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();

        if hosts.is_empty() {
            return Err(BusError::InvalidSettings {
                reason: "host list is empty".to_string(),
            });
        }

        Ok(hosts)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.retry_delay_ms))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// 心跳间隔；关闭心跳时为 None
    pub fn heartbeat(&self) -> Option<Duration> {
        self.client
            .heartbeat_enabled
            .then(|| Duration::from_secs(u64::from(self.client.heartbeat_secs)))
    }
}

/// 客户端相关配置
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    #[builder(default = true)]
    pub heartbeat_enabled: bool,
    #[builder(default = 120)]
    pub heartbeat_secs: u16,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// 工作队列配置
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    #[builder(default, into)]
    pub name: String,
    #[builder(default = true)]
    pub durable: bool,
    #[builder(default)]
    pub exclusive: bool,
    #[builder(default)]
    pub auto_delete: bool,
    /// 启动时清空工作队列
    #[builder(default)]
    pub purge_on_startup: bool,
    /// 工作队列的声明参数
    #[builder(default)]
    pub arguments: FieldTable,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn default_machine_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
