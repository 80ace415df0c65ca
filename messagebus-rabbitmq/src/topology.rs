//! 队列拓扑（QueueTopology）
//!
//! 由传输配置与工作队列名派生，每个消费者一份：
//! - 工作队列 `Q`；
//! - 重试队列 `Q.Retries`：固定消息 TTL（即重试延迟），到期后经死信交换机回到 `Q`；
//! - 重试死信交换机 `Q.Retries.DeadLetter`（direct），以 `Q` 为路由键绑定到 `Q`；
//! - 错误交换机/队列（direct，空路由键绑定）；
//! - 审计交换机/队列（仅在开启审计时声明）；
//! - 每个订阅的消息类型一个同名扇出交换机，绑定到 `Q`。
//!
//! 每一步声明都单独保护：失败（例如已存在但参数不同）只记录警告，不中断启动。
//!
use crate::transport::{Channel, ExchangeKind, ExchangeOptions, QueueOptions};
use messagebus_core::{BusError, FieldTable, HeaderValue, TransportSettings};
use tracing::Span;

/// 队列声明参数键
pub mod args {
    pub const MESSAGE_TTL: &str = "x-message-ttl";
    pub const DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
    pub const DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
}

pub const RETRY_QUEUE_SUFFIX: &str = ".Retries";
pub const RETRY_DEAD_LETTER_SUFFIX: &str = ".Retries.DeadLetter";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub work_queue: String,
    pub retry_queue: String,
    pub retry_dead_letter_exchange: String,
    pub error_exchange: String,
    pub error_queue: String,
    pub audit_exchange: Option<String>,
    pub audit_queue: Option<String>,
    pub queue_options: QueueOptions,
    pub work_arguments: FieldTable,
    pub retry_delay_ms: u32,
}

impl QueueTopology {
    pub fn new(
        settings: &TransportSettings,
        queue_name: &str,
        exclusive: Option<bool>,
        auto_delete: Option<bool>,
    ) -> Self {
        let audit = settings.auditing_enabled;
        Self {
            work_queue: queue_name.to_string(),
            retry_queue: format!("{queue_name}{RETRY_QUEUE_SUFFIX}"),
            retry_dead_letter_exchange: format!("{queue_name}{RETRY_DEAD_LETTER_SUFFIX}"),
            error_exchange: settings.error_queue_name.clone(),
            error_queue: settings.error_queue_name.clone(),
            audit_exchange: audit.then(|| settings.audit_queue_name.clone()),
            audit_queue: audit.then(|| settings.audit_queue_name.clone()),
            queue_options: QueueOptions {
                durable: settings.queue.durable,
                exclusive: exclusive.unwrap_or(settings.queue.exclusive),
                auto_delete: auto_delete.unwrap_or(settings.queue.auto_delete),
            },
            work_arguments: settings.queue.arguments.clone(),
            retry_delay_ms: settings.retry_delay_ms,
        }
    }

    /// 重试队列参数：TTL 到期后投递到死信交换机，并以工作队列名作为路由键
    pub fn retry_queue_arguments(&self) -> FieldTable {
        [
            (
                args::DEAD_LETTER_EXCHANGE,
                HeaderValue::from(self.retry_dead_letter_exchange.as_str()),
            ),
            (
                args::DEAD_LETTER_ROUTING_KEY,
                HeaderValue::from(self.work_queue.as_str()),
            ),
            (args::MESSAGE_TTL, HeaderValue::from(self.retry_delay_ms)),
        ]
        .into_iter()
        .collect::<FieldTable>()
    }

    fn exchange_options(&self) -> ExchangeOptions {
        ExchangeOptions {
            durable: self.queue_options.durable,
            auto_delete: self.queue_options.auto_delete,
        }
    }

    /// 声明完整拓扑；返回所有被吞掉的声明失败（已记录警告）
    pub async fn declare(&self, channel: &dyn Channel, purge: bool, span: &Span) -> Vec<BusError> {
        let mut failures = Vec::new();
        let mut guard = |step: &str, result: Result<(), BusError>| {
            if let Err(e) = result {
                tracing::warn!(parent: span, step, error = %e, "error declaring topology");
                failures.push(e);
            }
        };

        // WORK QUEUE
        tracing::debug!(parent: span, queue = %self.work_queue, "configuring queue");
        guard(
            "work queue",
            channel
                .queue_declare(&self.work_queue, self.queue_options, &self.work_arguments)
                .await,
        );

        // RETRY QUEUE
        tracing::debug!(parent: span, exchange = %self.retry_dead_letter_exchange, "configuring retry exchange");
        guard(
            "retry dead letter exchange",
            channel
                .exchange_declare(
                    &self.retry_dead_letter_exchange,
                    ExchangeKind::Direct,
                    self.exchange_options(),
                )
                .await,
        );
        guard(
            "retry dead letter binding",
            channel
                .queue_bind(
                    &self.work_queue,
                    &self.retry_dead_letter_exchange,
                    &self.work_queue,
                )
                .await,
        );
        tracing::debug!(parent: span, queue = %self.retry_queue, "configuring retry queue");
        guard(
            "retry queue",
            channel
                .queue_declare(
                    &self.retry_queue,
                    self.queue_options,
                    &self.retry_queue_arguments(),
                )
                .await,
        );

        // ERROR QUEUE
        tracing::debug!(parent: span, exchange = %self.error_exchange, "configuring error exchange");
        guard(
            "error exchange",
            channel
                .exchange_declare(&self.error_exchange, ExchangeKind::Direct, durable_exchange())
                .await,
        );
        guard(
            "error queue",
            channel
                .queue_declare(&self.error_queue, durable_queue(), &FieldTable::new())
                .await,
        );
        guard(
            "error binding",
            channel
                .queue_bind(&self.error_queue, &self.error_exchange, "")
                .await,
        );

        if purge {
            tracing::debug!(parent: span, queue = %self.work_queue, "purging queue");
            guard(
                "purge",
                channel.queue_purge(&self.work_queue).await.map(|_| ()),
            );
        }

        // AUDIT QUEUE
        if let (Some(exchange), Some(queue)) = (&self.audit_exchange, &self.audit_queue) {
            tracing::debug!(parent: span, exchange = %exchange, "configuring audit exchange");
            guard(
                "audit exchange",
                channel
                    .exchange_declare(exchange, ExchangeKind::Direct, durable_exchange())
                    .await,
            );
            guard(
                "audit queue",
                channel
                    .queue_declare(queue, durable_queue(), &FieldTable::new())
                    .await,
            );
            guard("audit binding", channel.queue_bind(queue, exchange, "").await);
        }

        failures
    }

    /// 声明（或复用）消息类型的扇出交换机并绑定到工作队列
    pub async fn declare_message_type(
        &self,
        channel: &dyn Channel,
        type_name: &str,
        span: &Span,
    ) -> Vec<BusError> {
        let mut failures = Vec::new();

        tracing::debug!(parent: span, exchange = type_name, "configuring exchange");
        if let Err(e) = channel
            .exchange_declare(type_name, ExchangeKind::Fanout, self.exchange_options())
            .await
        {
            tracing::warn!(parent: span, exchange = type_name, error = %e, "error declaring exchange");
            failures.push(e);
        }
        if let Err(e) = channel.queue_bind(&self.work_queue, type_name, "").await {
            tracing::warn!(parent: span, exchange = type_name, error = %e, "error binding queue to exchange");
            failures.push(e);
        }

        failures
    }
}

fn durable_queue() -> QueueOptions {
    QueueOptions {
        durable: true,
        exclusive: false,
        auto_delete: false,
    }
}

fn durable_exchange() -> ExchangeOptions {
    ExchangeOptions {
        durable: true,
        auto_delete: false,
    }
}
