//! RabbitMQ 投递管道
//!
//! - `Consumer`：声明队列拓扑、消费工作队列，按处理结果确认、重试或转入错误交换机，
//!   并在连接丢失时进行多主机故障转移与重连；
//! - `QueueTopology`：由配置派生的队列/交换机命名与声明；
//! - `transport`：中间件协议抽象、内存实现，以及基于 lapin 的 AMQP 实现（feature `amqp`）。
//!
pub mod consumer;
pub mod topology;
pub mod transport;

pub use consumer::Consumer;
pub use topology::QueueTopology;
pub use transport::inmemory::InMemoryBroker;
#[cfg(feature = "amqp")]
pub use transport::amqp::AmqpConnector;
