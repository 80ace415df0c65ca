//! 基于内存的消息中间件（InMemoryBroker）
//!
//! 以 AMQP 0-9-1 的语义模拟一台 broker，供测试与本地开发使用：
//! - 默认交换机（空名）按路由键直达同名队列；direct 按路由键匹配，fanout 投递到全部绑定；
//! - 队列参数 `x-message-ttl` 与 `x-dead-letter-exchange`/`x-dead-letter-routing-key` 生效，
//!   到期消息经死信交换机重新路由；
//! - 重复声明参数不同的队列/交换机会失败（但不关闭信道）；
//! - 未确认的投递在信道/连接关闭或连接被切断时重新入队，并标记 redelivered；
//! - 可将主机置为不可用、切断全部连接、拒绝发往指定交换机的发布，用于故障注入。
//!
use super::{
    Channel, Connection, ConnectionParams, Connector, Delivery, DeliveryStream, ExchangeKind,
    ExchangeOptions, QueueOptions,
};
use crate::topology::args;
use async_trait::async_trait;
use messagebus_core::{BusError, Envelope, FieldTable, HeaderValue, error::BusResult as Result};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Span;

#[derive(Debug, Clone)]
struct Queued {
    id: u64,
    routing_key: String,
    envelope: Envelope,
    redelivered: bool,
}

struct QueueState {
    options: QueueOptions,
    arguments: FieldTable,
    messages: VecDeque<Queued>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn ttl(&self) -> Option<Duration> {
        self.arguments
            .get(args::MESSAGE_TTL)
            .and_then(HeaderValue::as_int)
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
    }

    /// 死信目标：(交换机, 路由键)，未配置路由键时沿用原路由键
    fn dead_letter_target(&self, routing_key: &str) -> Option<(String, String)> {
        let exchange = self
            .arguments
            .get(args::DEAD_LETTER_EXCHANGE)
            .and_then(HeaderValue::as_text)?;
        let routing_key = self
            .arguments
            .get(args::DEAD_LETTER_ROUTING_KEY)
            .and_then(HeaderValue::as_text)
            .unwrap_or_else(|| routing_key.to_string());
        Some((exchange, routing_key))
    }
}

struct ExchangeState {
    kind: ExchangeKind,
    options: ExchangeOptions,
    /// (队列, 路由键)
    bindings: Vec<(String, String)>,
}

struct ConnectionState {
    host: String,
    lost: CancellationToken,
    closed: CancellationToken,
}

struct ChannelState {
    connection_id: u64,
    closed: CancellationToken,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, Queued)>,
}

/// 新入队消息的后续处理信息
struct Enqueued {
    queue: String,
    id: u64,
    ttl: Option<Duration>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    down_hosts: HashSet<String>,
    rejected_exchanges: HashSet<String>,
    connect_attempts: Vec<String>,
    next_id: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<Vec<Enqueued>> {
        if self.rejected_exchanges.contains(exchange) {
            return Err(BusError::publish(
                exchange,
                routing_key,
                "publish was not confirmed by broker",
            ));
        }

        let mut targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            let ex = self.exchanges.get(exchange).ok_or_else(|| {
                BusError::publish(exchange, routing_key, "NOT_FOUND - no exchange")
            })?;
            ex.bindings
                .iter()
                .filter(|(_, key)| ex.kind == ExchangeKind::Fanout || key == routing_key)
                .map(|(queue, _)| queue.clone())
                .collect()
        };
        targets.sort();
        targets.dedup();

        let mut routed = Vec::with_capacity(targets.len());
        for queue in targets {
            let id = self.next_id();
            // 无法路由的消息被丢弃
            let Some(q) = self.queues.get_mut(&queue) else {
                continue;
            };
            q.messages.push_back(Queued {
                id,
                routing_key: routing_key.to_string(),
                envelope: envelope.clone(),
                redelivered: false,
            });
            routed.push(Enqueued {
                ttl: q.ttl(),
                notify: q.notify.clone(),
                queue,
                id,
            });
        }
        Ok(routed)
    }

    fn requeue(&mut self, queue: &str, mut message: Queued) -> Option<Arc<Notify>> {
        let q = self.queues.get_mut(queue)?;
        message.redelivered = true;
        q.messages.push_front(message);
        Some(q.notify.clone())
    }

    /// 移除信道并将其全部未确认投递按原顺序放回队首
    fn drop_channel(&mut self, channel_id: u64) -> Vec<Arc<Notify>> {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return Vec::new();
        };
        channel.closed.cancel();
        channel
            .unacked
            .into_values()
            .rev()
            .filter_map(|(queue, message)| self.requeue(&queue, message))
            .collect()
    }

    fn drop_connection(&mut self, connection_id: u64) -> Vec<Arc<Notify>> {
        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        let notifies = channel_ids
            .into_iter()
            .flat_map(|id| self.drop_channel(id))
            .collect();
        if let Some(connection) = self.connections.remove(&connection_id) {
            connection.closed.cancel();
        }
        notifies
    }

    fn pop(&mut self, channel_id: u64, queue: &str) -> Option<Delivery> {
        let channel = self.channels.get_mut(&channel_id)?;
        let message = self.queues.get_mut(queue)?.messages.pop_front()?;
        channel.next_tag += 1;
        let delivery = Delivery {
            delivery_tag: channel.next_tag,
            redelivered: message.redelivered,
            envelope: message.envelope.clone(),
        };
        channel
            .unacked
            .insert(channel.next_tag, (queue.to_string(), message));
        Some(delivery)
    }

    fn channel_mut(&mut self, channel_id: u64) -> Result<&mut ChannelState> {
        self.channels
            .get_mut(&channel_id)
            .ok_or_else(|| BusError::connection_lost("channel is closed"))
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    span: Span,
}

impl BrokerInner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn wake(notifies: Vec<Arc<Notify>>) {
    for n in notifies {
        n.notify_waiters();
    }
}

fn publish(inner: &Arc<BrokerInner>, exchange: &str, routing_key: &str, envelope: &Envelope) -> Result<()> {
    let routed = inner.state().route(exchange, routing_key, envelope)?;
    for enqueued in routed {
        enqueued.notify.notify_waiters();
        if let Some(ttl) = enqueued.ttl {
            schedule_expiry(inner, enqueued.queue, enqueued.id, ttl);
        }
    }
    Ok(())
}

fn schedule_expiry(inner: &Arc<BrokerInner>, queue: String, id: u64, ttl: Duration) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!(parent: &inner.span, queue = %queue, "no runtime available, message ttl ignored");
        return;
    };
    let weak = Arc::downgrade(inner);
    runtime.spawn(async move {
        tokio::time::sleep(ttl).await;
        if let Some(inner) = weak.upgrade() {
            expire(&inner, &queue, id);
        }
    });
}

/// TTL 到期：仍在队列中的消息被移出并投递到死信交换机
fn expire(inner: &Arc<BrokerInner>, queue: &str, id: u64) {
    let dead_letter = {
        let mut state = inner.state();
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        let Some(pos) = q.messages.iter().position(|m| m.id == id) else {
            return;
        };
        let Some(message) = q.messages.remove(pos) else {
            return;
        };
        q.dead_letter_target(&message.routing_key)
            .map(|(exchange, routing_key)| (exchange, routing_key, message.envelope))
    };

    if let Some((exchange, routing_key, envelope)) = dead_letter {
        tracing::trace!(parent: &inner.span, queue, exchange = %exchange, "message expired, dead-lettering");
        if let Err(e) = publish(inner, &exchange, &routing_key, &envelope) {
            tracing::warn!(parent: &inner.span, queue, error = %e, "dead-lettering failed, message dropped");
        }
    }
}

/// 内存 broker；克隆共享同一份状态
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(Span::none())
    }
}

impl InMemoryBroker {
    pub fn new(span: Span) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                span,
            }),
        }
    }

    /// 置主机为不可用（拒绝新连接）或恢复
    pub fn set_host_down(&self, host: &str, down: bool) {
        let mut state = self.inner.state();
        if down {
            state.down_hosts.insert(host.to_string());
        } else {
            state.down_hosts.remove(host);
        }
    }

    /// 模拟心跳超时：切断全部连接，返回被切断的连接数
    pub fn sever_connections(&self) -> usize {
        let (count, notifies) = {
            let mut state = self.inner.state();
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            let mut notifies = Vec::new();
            for id in &ids {
                if let Some(connection) = state.connections.get(id) {
                    connection.lost.cancel();
                }
                notifies.extend(state.drop_connection(*id));
            }
            (ids.len(), notifies)
        };
        tracing::debug!(parent: &self.inner.span, count, "connections severed");
        wake(notifies);
        count
    }

    /// 发往该交换机的发布将不被确认
    pub fn reject_publishes_to(&self, exchange: &str) {
        self.inner
            .state()
            .rejected_exchanges
            .insert(exchange.to_string());
    }

    pub fn accept_publishes_to(&self, exchange: &str) {
        self.inner.state().rejected_exchanges.remove(exchange);
    }

    /// 以外部生产者身份发布
    pub fn publish(&self, exchange: &str, routing_key: &str, envelope: &Envelope) -> Result<()> {
        publish(&self.inner, exchange, routing_key, envelope)
    }

    /// 按顺序记录的连接尝试（主机名）
    pub fn connect_attempts(&self) -> Vec<String> {
        self.inner.state().connect_attempts.clone()
    }

    /// 当前打开的连接所在主机
    pub fn open_connections(&self) -> Vec<String> {
        self.inner
            .state()
            .connections
            .values()
            .map(|c| c.host.clone())
            .collect()
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .state()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// 队列中（未投递）消息的快照
    pub fn queue_messages(&self, queue: &str) -> Vec<Envelope> {
        self.inner
            .state()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.envelope.clone()).collect())
            .unwrap_or_default()
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<FieldTable> {
        self.inner
            .state()
            .queues
            .get(queue)
            .map(|q| q.arguments.clone())
    }

    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.inner.state().queues.get(queue).map(|q| q.options)
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.inner.state().exchanges.get(exchange).map(|e| e.kind)
    }

    /// 交换机的绑定：(队列, 路由键)
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.inner
            .state()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }

    /// 所有信道上已投递未确认的消息数
    pub fn unacked_count(&self) -> usize {
        self.inner
            .state()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn Connection>> {
        let connection = {
            let mut state = self.inner.state();
            state.connect_attempts.push(params.host.clone());
            if state.down_hosts.contains(&params.host) {
                return Err(BusError::connection(&params.host, "connection refused"));
            }
            let id = state.next_id();
            let lost = CancellationToken::new();
            let closed = CancellationToken::new();
            state.connections.insert(
                id,
                ConnectionState {
                    host: params.host.clone(),
                    lost: lost.clone(),
                    closed: closed.clone(),
                },
            );
            InMemoryConnection {
                broker: self.inner.clone(),
                id,
                lost,
                closed,
            }
        };
        tracing::debug!(parent: &self.inner.span, host = %params.host, "connection opened");
        Ok(Arc::new(connection))
    }
}

struct InMemoryConnection {
    broker: Arc<BrokerInner>,
    id: u64,
    lost: CancellationToken,
    closed: CancellationToken,
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        let mut state = self.broker.state();
        if !state.connections.contains_key(&self.id) {
            return Err(BusError::connection_lost("connection is closed"));
        }
        let id = state.next_id();
        let closed = self.closed.child_token();
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                closed: closed.clone(),
                next_tag: 0,
                unacked: BTreeMap::new(),
            },
        );
        Ok(Arc::new(InMemoryChannel {
            broker: self.broker.clone(),
            id,
            lost: self.lost.clone(),
            closed,
        }))
    }

    async fn close(&self) -> Result<()> {
        let notifies = self.broker.state().drop_connection(self.id);
        wake(notifies);
        Ok(())
    }
}

struct InMemoryChannel {
    broker: Arc<BrokerInner>,
    id: u64,
    lost: CancellationToken,
    closed: CancellationToken,
}

impl InMemoryChannel {
    fn ensure_open(&self, state: &BrokerState) -> Result<()> {
        if state.channels.contains_key(&self.id) {
            Ok(())
        } else {
            Err(BusError::connection_lost("channel is closed"))
        }
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueOptions,
        arguments: &FieldTable,
    ) -> Result<()> {
        let mut state = self.broker.state();
        self.ensure_open(&state)?;
        if let Some(existing) = state.queues.get(queue) {
            if existing.options != options || &existing.arguments != arguments {
                return Err(BusError::topology(
                    queue,
                    "PRECONDITION_FAILED - inequivalent arg for queue",
                ));
            }
            return Ok(());
        }
        state.queues.insert(
            queue.to_string(),
            QueueState {
                options,
                arguments: arguments.clone(),
                messages: VecDeque::new(),
                notify: Arc::new(Notify::new()),
            },
        );
        Ok(())
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<()> {
        let mut state = self.broker.state();
        self.ensure_open(&state)?;
        if exchange.is_empty() {
            return Err(BusError::topology(exchange, "ACCESS_REFUSED - default exchange"));
        }
        if let Some(existing) = state.exchanges.get(exchange) {
            if existing.kind != kind || existing.options != options {
                return Err(BusError::topology(
                    exchange,
                    format!("PRECONDITION_FAILED - inequivalent arg 'type' or options, declared {}", existing.kind),
                ));
            }
            return Ok(());
        }
        state.exchanges.insert(
            exchange.to_string(),
            ExchangeState {
                kind,
                options,
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.broker.state();
        self.ensure_open(&state)?;
        if !state.queues.contains_key(queue) {
            return Err(BusError::topology(queue, "NOT_FOUND - no queue"));
        }
        let Some(ex) = state.exchanges.get_mut(exchange) else {
            return Err(BusError::topology(exchange, "NOT_FOUND - no exchange"));
        };
        let binding = (queue.to_string(), routing_key.to_string());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32> {
        let mut state = self.broker.state();
        self.ensure_open(&state)?;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::topology(queue, "NOT_FOUND - no queue"))?;
        let purged = q.messages.len();
        q.messages.clear();
        Ok(u32::try_from(purged).unwrap_or(u32::MAX))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<()> {
        self.ensure_open(&self.broker.state())?;
        publish(&self.broker, exchange, routing_key, envelope)
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        {
            let state = self.broker.state();
            self.ensure_open(&state)?;
            if !state.queues.contains_key(queue) {
                return Err(BusError::topology(queue, "NOT_FOUND - no queue"));
            }
        }
        tracing::debug!(parent: &self.broker.span, queue, consumer_tag, "consumer registered");

        let (tx, rx) = mpsc::channel::<Result<Delivery>>(1);
        let pump = Pump {
            broker: self.broker.clone(),
            channel_id: self.id,
            queue: queue.to_string(),
            lost: self.lost.clone(),
            closed: self.closed.clone(),
        };
        tokio::spawn(pump.run(tx));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.broker.state();
        state
            .channel_mut(self.id)?
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| BusError::connection_lost("PRECONDITION_FAILED - unknown delivery tag"))
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let notify = {
            let mut state = self.broker.state();
            let (queue, message) = state
                .channel_mut(self.id)?
                .unacked
                .remove(&delivery_tag)
                .ok_or_else(|| {
                    BusError::connection_lost("PRECONDITION_FAILED - unknown delivery tag")
                })?;
            if requeue {
                state.requeue(&queue, message)
            } else {
                None
            }
        };
        if let Some(n) = notify {
            n.notify_waiters();
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let notifies = self.broker.state().drop_channel(self.id);
        wake(notifies);
        Ok(())
    }
}

/// 将队列中的消息逐条推送给一个消费者（预取为 1）
struct Pump {
    broker: Arc<BrokerInner>,
    channel_id: u64,
    queue: String,
    lost: CancellationToken,
    closed: CancellationToken,
}

impl Pump {
    async fn run(self, tx: mpsc::Sender<Result<Delivery>>) {
        loop {
            let permit = tokio::select! {
                biased;
                _ = self.lost.cancelled() => {
                    let _ = tx.send(Err(BusError::connection_lost("missed heartbeats from server"))).await;
                    return;
                }
                _ = self.closed.cancelled() => return,
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            match self.next_delivery().await {
                Some(delivery) => permit.send(Ok(delivery)),
                None => {
                    if self.lost.is_cancelled() {
                        permit.send(Err(BusError::connection_lost(
                            "missed heartbeats from server",
                        )));
                    }
                    return;
                }
            }
        }
    }

    /// 等待下一条消息；连接丢失、信道关闭或队列不存在时返回 None
    async fn next_delivery(&self) -> Option<Delivery> {
        loop {
            let notify = {
                let state = self.broker.state();
                state.queues.get(&self.queue).map(|q| q.notify.clone())
            }?;
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = {
                let mut state = self.broker.state();
                state.pop(self.channel_id, &self.queue)
            };
            if popped.is_some() {
                return popped;
            }

            tokio::select! {
                biased;
                _ = self.lost.cancelled() => return None,
                _ = self.closed.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn params(host: &str) -> ConnectionParams {
        ConnectionParams {
            host: host.to_string(),
            username: None,
            password: None,
            heartbeat: None,
        }
    }

    fn envelope(body: &str) -> Envelope {
        Envelope::new(body.as_bytes().to_vec(), FieldTable::new())
    }

    async fn open(broker: &InMemoryBroker) -> Arc<dyn Channel> {
        let connection = broker.connect(&params("localhost")).await.unwrap();
        connection.create_channel().await.unwrap()
    }

    #[tokio::test]
    async fn routes_by_exchange_kind() {
        let broker = InMemoryBroker::default();
        let ch = open(&broker).await;
        for q in ["a", "b"] {
            ch.queue_declare(q, QueueOptions::default(), &FieldTable::new())
                .await
                .unwrap();
        }
        ch.exchange_declare("fan", ExchangeKind::Fanout, ExchangeOptions::default())
            .await
            .unwrap();
        ch.exchange_declare("dir", ExchangeKind::Direct, ExchangeOptions::default())
            .await
            .unwrap();
        ch.queue_bind("a", "fan", "").await.unwrap();
        ch.queue_bind("b", "fan", "").await.unwrap();
        ch.queue_bind("a", "dir", "k").await.unwrap();

        ch.basic_publish("fan", "whatever", &envelope("1")).await.unwrap();
        ch.basic_publish("dir", "k", &envelope("2")).await.unwrap();
        ch.basic_publish("dir", "other", &envelope("3")).await.unwrap();
        ch.basic_publish("", "b", &envelope("4")).await.unwrap();

        assert_eq!(broker.queue_len("a"), 2);
        assert_eq!(broker.queue_len("b"), 2);
        assert!(ch.basic_publish("missing", "", &envelope("5")).await.is_err());
    }

    #[tokio::test]
    async fn redeclare_with_different_arguments_fails() {
        let broker = InMemoryBroker::default();
        let ch = open(&broker).await;
        let args: FieldTable = [(args::MESSAGE_TTL, HeaderValue::Int(10))].into_iter().collect();
        ch.queue_declare("q", QueueOptions::default(), &args).await.unwrap();
        ch.queue_declare("q", QueueOptions::default(), &args).await.unwrap();

        let err = ch
            .queue_declare("q", QueueOptions::default(), &FieldTable::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::TopologyDeclaration { .. }));
        // 信道仍可用
        ch.queue_purge("q").await.unwrap();
    }

    #[tokio::test]
    async fn expired_messages_are_dead_lettered() {
        let broker = InMemoryBroker::default();
        let ch = open(&broker).await;
        ch.queue_declare("work", QueueOptions::default(), &FieldTable::new())
            .await
            .unwrap();
        ch.exchange_declare("dlx", ExchangeKind::Direct, ExchangeOptions::default())
            .await
            .unwrap();
        ch.queue_bind("work", "dlx", "work").await.unwrap();
        let retry_args: FieldTable = [
            (args::MESSAGE_TTL, HeaderValue::Int(20)),
            (args::DEAD_LETTER_EXCHANGE, HeaderValue::from("dlx")),
            (args::DEAD_LETTER_ROUTING_KEY, HeaderValue::from("work")),
        ]
        .into_iter()
        .collect();
        ch.queue_declare("retry", QueueOptions::default(), &retry_args)
            .await
            .unwrap();

        ch.basic_publish("", "retry", &envelope("later")).await.unwrap();
        assert_eq!(broker.queue_len("retry"), 1);
        assert_eq!(broker.queue_len("work"), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.queue_len("retry"), 0);
        assert_eq!(broker.queue_messages("work"), vec![envelope("later")]);
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        let broker = InMemoryBroker::default();
        let ch = open(&broker).await;
        ch.queue_declare("q", QueueOptions::default(), &FieldTable::new())
            .await
            .unwrap();
        broker.publish("", "q", &envelope("x")).unwrap();

        let mut stream = ch.basic_consume("q", "c1").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        assert_eq!(broker.unacked_count(), 1);

        ch.basic_nack(first.delivery_tag, true).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.envelope, envelope("x"));

        ch.basic_ack(second.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert!(ch.basic_ack(second.delivery_tag).await.is_err());
    }

    #[tokio::test]
    async fn severed_connection_ends_stream_and_requeues() {
        let broker = InMemoryBroker::default();
        let ch = open(&broker).await;
        ch.queue_declare("q", QueueOptions::default(), &FieldTable::new())
            .await
            .unwrap();
        broker.publish("", "q", &envelope("x")).unwrap();
        let mut stream = ch.basic_consume("q", "c1").await.unwrap();
        let _unacked = stream.next().await.unwrap().unwrap();

        assert_eq!(broker.sever_connections(), 1);

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(broker.queue_len("q"), 1);
        assert!(broker.open_connections().is_empty());
    }

    #[tokio::test]
    async fn down_host_refuses_connections() {
        let broker = InMemoryBroker::default();
        broker.set_host_down("h1", true);
        assert!(broker.connect(&params("h1")).await.is_err());
        assert!(broker.connect(&params("h2")).await.is_ok());
        broker.set_host_down("h1", false);
        assert!(broker.connect(&params("h1")).await.is_ok());
        assert_eq!(broker.connect_attempts(), vec!["h1", "h2", "h1"]);
    }
}
