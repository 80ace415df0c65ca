//! 内存版持久化实现
//!
//! - `InMemoryProcessManagerFinder`：流程管理器关联存储；
//! - `InMemoryAggregatorPersistor`：聚合缓冲区。
//!
//! 两者均基于 `DashMap`，按键分片加锁，变更操作在同一键上互斥，
//! 不与变更竞争的读取可以并发进行。数据仅在进程生命周期内有效。
pub mod inmemory_aggregator_persistor;
pub mod inmemory_process_manager_finder;

pub use inmemory_aggregator_persistor::InMemoryAggregatorPersistor;
pub use inmemory_process_manager_finder::InMemoryProcessManagerFinder;
