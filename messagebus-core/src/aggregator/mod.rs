//! 聚合器（Aggregator）
//!
//! 按消息类型缓冲消息，并在固定时间窗口内作为一批交给聚合处理器：
//! - `AggregatorPersistor`：按类型键保存待处理负载，刷新时原子地取出并清空；
//! - `AggregatorRegistry`：类型标记到聚合处理器的注册表，启动时注册；
//! - `AggregatorTimer`：周期任务，每个时间窗口刷新一次缓冲区（需 `timer` 特性）。
//!
mod persistor;
mod registry;
#[cfg(feature = "timer")]
mod timer;

pub use persistor::{AggregatorPersistor, AggregatorPersistorExt};
pub use registry::AggregatorRegistry;
#[cfg(feature = "timer")]
pub use timer::AggregatorTimer;

use crate::message::MessageType;
use async_trait::async_trait;

/// 聚合处理器：一次处理同一类型的一批消息
#[async_trait]
pub trait Aggregator<T: MessageType>: Send + Sync {
    /// 处理器名称（用于日志与错误）
    fn handler_name(&self) -> &str;

    async fn execute(&self, batch: Vec<T>) -> anyhow::Result<()>;
}
