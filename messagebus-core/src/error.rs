//! 消息总线统一错误定义
//!
//! 覆盖投递管道、拓扑声明、传输连接、关联存储与聚合器的最小必要集合，
//! 便于各实现层统一转换为 `BusError`。
//!
use thiserror::Error;
use uuid::Uuid;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BusError {
    // --- 投递管道 ---
    #[error("message headers must contain FullTypeName")]
    MissingTypeHeader,
    #[error("handler execution failed: {message}")]
    HandlerExecution { message: String },
    #[error("max number of retries exceeded: retry_count={retry_count}")]
    MaxRetriesExceeded { retry_count: u32 },

    // --- 拓扑/传输 ---
    #[error("topology declaration failed: object={object}, reason={reason}")]
    TopologyDeclaration { object: String, reason: String },
    #[error("transport connection failed: host={host}, reason={reason}")]
    TransportConnection { host: String, reason: String },
    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },
    #[error("publish failed: exchange={exchange}, routing_key={routing_key}, reason={reason}")]
    Publish {
        exchange: String,
        routing_key: String,
        reason: String,
    },
    #[error("consumer is not consuming")]
    NotConsuming,
    #[error("consumer is already consuming")]
    AlreadyConsuming,

    // --- 关联存储（流程管理器） ---
    #[error("duplicate correlation id: {0}")]
    DuplicateCorrelationId(Uuid),
    #[error("correlation not found: {0}")]
    CorrelationNotFound(Uuid),

    // --- 聚合器 ---
    #[error("no aggregator registered for message type: {type_name}")]
    AggregatorNotRegistered { type_name: String },
    #[error("aggregator already registered for message type: {type_name}")]
    AggregatorAlreadyRegistered { type_name: String },
    #[error("aggregator timer already started")]
    TimerAlreadyStarted,
    #[error("batch handler error: handler={handler}, reason={reason}")]
    BatchHandler { handler: String, reason: String },

    // --- 通用 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("type mismatch: expected={expected}, found={found}")]
    TypeMismatch { expected: String, found: String },
    #[error("invalid settings: {reason}")]
    InvalidSettings { reason: String },
}

impl BusError {
    pub fn topology(object: impl Into<String>, reason: impl ToString) -> Self {
        BusError::TopologyDeclaration {
            object: object.into(),
            reason: reason.to_string(),
        }
    }

    pub fn publish(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        BusError::Publish {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn connection(host: impl Into<String>, reason: impl ToString) -> Self {
        BusError::TransportConnection {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    pub fn connection_lost(reason: impl ToString) -> Self {
        BusError::ConnectionLost {
            reason: reason.to_string(),
        }
    }

    /// 错误种类名称，写入 Exception 消息头的 ExceptionType
    pub fn kind(&self) -> &'static str {
        match self {
            BusError::MissingTypeHeader => "MissingTypeHeader",
            BusError::HandlerExecution { .. } => "HandlerExecutionError",
            BusError::MaxRetriesExceeded { .. } => "MaxRetriesExceeded",
            BusError::TopologyDeclaration { .. } => "TopologyDeclarationError",
            BusError::TransportConnection { .. } => "TransportConnectionError",
            BusError::ConnectionLost { .. } => "ConnectionLost",
            BusError::Publish { .. } => "PublishError",
            BusError::NotConsuming => "NotConsuming",
            BusError::AlreadyConsuming => "AlreadyConsuming",
            BusError::DuplicateCorrelationId(_) => "DuplicateCorrelationId",
            BusError::CorrelationNotFound(_) => "CorrelationNotFound",
            BusError::AggregatorNotRegistered { .. } => "AggregatorNotRegistered",
            BusError::AggregatorAlreadyRegistered { .. } => "AggregatorAlreadyRegistered",
            BusError::TimerAlreadyStarted => "TimerAlreadyStarted",
            BusError::BatchHandler { .. } => "BatchHandlerError",
            BusError::Serde { .. } => "SerializationError",
            BusError::TypeMismatch { .. } => "TypeMismatch",
            BusError::InvalidSettings { .. } => "InvalidSettings",
        }
    }

    /// 连接类错误会触发消费者的重连流程
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            BusError::TransportConnection { .. } | BusError::ConnectionLost { .. }
        )
    }
}

/// 统一 Result 类型别名
pub type BusResult<T> = Result<T, BusError>;
