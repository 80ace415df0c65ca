//! 消费者事件处理器（ConsumerEventHandler）
//!
//! 投递管道对每条消息调用外部注入的处理器，处理结果统一为
//! `ConsumeEventResult`；处理器内部的任何错误都被捕获为结构化的
//! `HandlerError`，而不是向上传播。
//!
use crate::{envelope::Headers, error::BusError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::backtrace::BacktraceStatus;

/// 结构化的处理错误：固定字段，不对任意错误对象做反射
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerError {
    /// 错误种类
    pub kind: String,
    /// 顶层错误信息
    pub message: String,
    /// 嵌套原因链（由外到内，不含顶层）
    pub causes: Vec<String>,
    pub stack_trace: Option<String>,
    /// 出错来源（处理器名称等）
    pub source: Option<String>,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            causes: Vec::new(),
            stack_trace: None,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    /// 展开后的错误信息：顶层与每一层原因各占一行
    pub fn flattened_message(&self) -> String {
        std::iter::once(&self.message)
            .chain(self.causes.iter())
            .fold(String::new(), |mut acc, m| {
                acc.push_str(m);
                acc.push('\n');
                acc
            })
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<&anyhow::Error> for HandlerError {
    fn from(err: &anyhow::Error) -> Self {
        let bt = err.backtrace();
        let stack_trace = (bt.status() == BacktraceStatus::Captured).then(|| bt.to_string());
        let kind = err
            .downcast_ref::<BusError>()
            .map(|e| e.kind().to_string())
            .unwrap_or_else(|| "HandlerExecutionError".to_string());

        Self {
            kind,
            message: err.to_string(),
            causes: err.chain().skip(1).map(|c| c.to_string()).collect(),
            stack_trace,
            source: None,
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::from(&err)
    }
}

impl From<&BusError> for HandlerError {
    fn from(err: &BusError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<BusError> for HandlerError {
    fn from(err: BusError) -> Self {
        Self::from(&err)
    }
}

/// 单条消息的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeEventResult {
    pub success: bool,
    pub exception: Option<HandlerError>,
}

impl ConsumeEventResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            exception: None,
        }
    }

    pub fn failed(exception: impl Into<HandlerError>) -> Self {
        Self {
            success: false,
            exception: Some(exception.into()),
        }
    }
}

impl From<anyhow::Result<()>> for ConsumeEventResult {
    fn from(result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::failed(e),
        }
    }
}

/// 消费者事件处理器：按消息类型分发并执行业务处理
#[async_trait]
pub trait ConsumerEventHandler: Send + Sync {
    async fn handle(&self, body: &[u8], type_name: &str, headers: &Headers) -> ConsumeEventResult;
}

/// 以同步闭包实现的处理器
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F> ConsumerEventHandler for HandlerFn<F>
where
    F: Fn(&[u8], &str, &Headers) -> ConsumeEventResult + Send + Sync,
{
    async fn handle(&self, body: &[u8], type_name: &str, headers: &Headers) -> ConsumeEventResult {
        (self.0)(body, type_name, headers)
    }
}
