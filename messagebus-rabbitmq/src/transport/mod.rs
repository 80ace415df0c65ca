//! 传输协议（Connector / Connection / Channel）
//!
//! 以 AMQP 0-9-1 的连接/信道模型抽象消息中间件，投递管道只依赖这些协议：
//! - `Connector`：按主机与凭据建立连接；
//! - `Connection`：创建信道、关闭连接；
//! - `Channel`：声明/绑定/清空、发布、消费与确认。
//!
//! 消费得到的投递流以 `Err(ConnectionLost)` 或流结束表示连接丢失（心跳超时等），
//! 由消费者据此触发故障转移与重连。
//!
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use messagebus_core::{Envelope, FieldTable, error::BusResult as Result};
use std::{fmt, sync::Arc, time::Duration};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod inmemory;

/// 交换机类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => f.write_str("direct"),
            ExchangeKind::Fanout => f.write_str("fanout"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

/// 建立连接所需参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// 请求的心跳间隔；None 表示关闭心跳
    pub heartbeat: Option<Duration>,
}

/// 一次投递
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub envelope: Envelope,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn Connection>>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Channel: Send + Sync {
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueOptions,
        arguments: &FieldTable,
    ) -> Result<()>;

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<()>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// 清空队列，返回被移除的消息数
    async fn queue_purge(&self, queue: &str) -> Result<u32>;

    /// 发布消息；返回 Ok 表示中间件已确认接收
    async fn basic_publish(&self, exchange: &str, routing_key: &str, envelope: &Envelope)
    -> Result<()>;

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
