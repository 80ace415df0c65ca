//! 消息总线基础库（messagebus-core）
//!
//! 提供消息总线客户端在各传输实现之间共享的契约与构件：
//! - 消息信封与消息头（`envelope`），含“设置或清除”的消息头语义；
//! - 传输配置（`settings`）与统一错误（`error`）；
//! - 消费者处理器契约与结构化异常信息（`handler`、`exception`）；
//! - 流程管理器的关联存储协议（`process_manager`）；
//! - 按时间窗口批量处理的聚合器（`aggregator`）。
//!
//! 本 crate 不绑定具体的消息中间件，投递管道由传输实现（如 RabbitMQ）提供，
//! 关联存储与聚合缓冲区的内存实现见 `messagebus-persistence`。
//!
pub mod aggregator;
pub mod envelope;
pub mod error;
pub mod exception;
pub mod handler;
pub mod message;
pub mod process_manager;
pub mod settings;

pub use envelope::{Envelope, FieldTable, HeaderValue, Headers, header};
pub use error::{BusError, BusResult};
pub use handler::{ConsumeEventResult, ConsumerEventHandler, HandlerError, HandlerFn};
pub use message::MessageType;
pub use settings::{ClientSettings, QueueSettings, TransportSettings};
