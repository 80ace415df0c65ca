//! 聚合定时器（AggregatorTimer）
//!
//! 在独立的周期任务中按固定时间窗口刷新某一消息类型的缓冲区：
//! - 首次触发在一个周期之后（不立即触发）；
//! - 缓冲区非空时解析聚合处理器、原子取出整批并调用一次；为空时不做任何事；
//! - 每次触发开始时检查取消令牌，`dispose` 取消并等待正在进行的刷新结束。
//!
//! 刷新失败时批次已被清空，不会保留或重放；错误记录日志并广播给订阅者。
//!
use super::{AggregatorPersistor, AggregatorRegistry};
use crate::{
    error::{BusError, BusResult},
    message::MessageType,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Span;

const FAILURE_CHANNEL_CAPACITY: usize = 16;

struct Flusher {
    persistor: Arc<dyn AggregatorPersistor>,
    registry: Arc<AggregatorRegistry>,
    span: Span,
}

impl Flusher {
    async fn flush(&self, type_name: &str) -> BusResult<usize> {
        if self.persistor.count(type_name).await? == 0 {
            return Ok(0);
        }

        let aggregator = self.registry.resolve(type_name)?;
        let batch = self.persistor.take_all(type_name).await?;
        // 与另一次刷新竞争时可能已被取空
        if batch.is_empty() {
            return Ok(0);
        }

        let size = batch.len();
        tracing::debug!(parent: &self.span, type_name, size, "flushing aggregator batch");

        if let Err(e) = aggregator.execute_values(batch).await {
            tracing::error!(
                parent: &self.span,
                type_name,
                handler = aggregator.handler_name(),
                error = %e,
                "error executing aggregator execute method"
            );
            return Err(e);
        }

        Ok(size)
    }
}

struct Running {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// 单个聚合器实例的定时器：同一时刻至多一个活动定时任务
pub struct AggregatorTimer {
    flusher: Arc<Flusher>,
    failures: broadcast::Sender<Arc<BusError>>,
    running: Option<Running>,
}

impl AggregatorTimer {
    pub fn new(
        persistor: Arc<dyn AggregatorPersistor>,
        registry: Arc<AggregatorRegistry>,
        span: Span,
    ) -> Self {
        let (failures, _rx) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            flusher: Arc::new(Flusher {
                persistor,
                registry,
                span,
            }),
            failures,
            running: None,
        }
    }

    /// 启动消息类型 `T` 的周期刷新，每隔 `period` 触发一次
    pub fn start_timer<T: MessageType>(&mut self, period: Duration) -> BusResult<()> {
        if self.running.is_some() {
            return Err(BusError::TimerAlreadyStarted);
        }
        if period.is_zero() {
            return Err(BusError::InvalidSettings {
                reason: "aggregator timer period must be non-zero".to_string(),
            });
        }
        if !self.flusher.registry.contains(T::TYPE_NAME) {
            return Err(BusError::AggregatorNotRegistered {
                type_name: T::TYPE_NAME.to_string(),
            });
        }

        let token = CancellationToken::new();
        let task = Self::spawn_periodic(
            token.clone(),
            period,
            self.flusher.clone(),
            self.failures.clone(),
            T::TYPE_NAME,
        );
        self.running = Some(Running { token, task });

        Ok(())
    }

    fn spawn_periodic(
        token: CancellationToken,
        period: Duration,
        flusher: Arc<Flusher>,
        failures: broadcast::Sender<Arc<BusError>>,
        type_name: &'static str,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if token.is_cancelled() {
                            break;
                        }
                        if let Err(e) = flusher.flush(type_name).await {
                            // 无订阅者时发送失败，可忽略
                            let _ = failures.send(Arc::new(e));
                        }
                    }
                }
            }
        })
    }

    /// 立即执行一次刷新，并把处理器错误返回给调用方
    pub async fn flush<T: MessageType>(&self) -> BusResult<usize> {
        self.flusher.flush(T::TYPE_NAME).await
    }

    /// 订阅周期刷新中的失败
    pub fn subscribe_failures(&self) -> broadcast::Receiver<Arc<BusError>> {
        self.failures.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// 停止定时器，并等待正在进行的刷新完成
    pub async fn dispose(&mut self) {
        if let Some(Running { token, task }) = self.running.take() {
            token.cancel();
            let _ = task.await;
        }
    }
}

impl Drop for AggregatorTimer {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.token.cancel();
        }
    }
}
