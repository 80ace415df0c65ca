use crate::topology::QueueTopology;
use crate::transport::{Channel, Connection, ConnectionParams, Connector, Delivery, DeliveryStream};
use chrono::Utc;
use futures_util::{FutureExt, StreamExt};
use messagebus_core::exception::ExceptionHeader;
use messagebus_core::{
    BusError, BusResult, ConsumeEventResult, ConsumerEventHandler, Envelope, HandlerError,
    TransportSettings, header,
};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Span;
use uuid::Uuid;

/// 投递管道：
/// - 持有一条连接与一个信道，声明队列拓扑并持续消费工作队列
/// - 对每条投递调用处理器，并按结果确认、转入重试队列或发布到错误交换机
/// - 连接丢失（心跳超时）时按主机列表轮转，并以固定间隔无限重连
pub struct Consumer {
    inner: Arc<Inner>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    settings: TransportSettings,
    hosts: Vec<String>,
    connector: Arc<dyn Connector>,
    span: Span,
    active_host: AtomicUsize,
    /// 主动停止；此后的连接丢失不触发重连
    connection_closed: AtomicBool,
    consuming: AtomicBool,
    token: CancellationToken,
    subscription: OnceLock<Arc<Subscription>>,
    message_types: Mutex<Vec<String>>,
    /// 打开/替换会话时持有，与消息类型声明互斥
    session: tokio::sync::Mutex<Option<Session>>,
}

struct Subscription {
    handler: Arc<dyn ConsumerEventHandler>,
    topology: QueueTopology,
}

#[derive(Clone)]
struct Session {
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
}

impl Consumer {
    pub fn new(
        settings: TransportSettings,
        connector: Arc<dyn Connector>,
        span: Span,
    ) -> BusResult<Self> {
        let hosts = settings.hosts()?;

        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                hosts,
                connector,
                span,
                active_host: AtomicUsize::new(0),
                connection_closed: AtomicBool::new(false),
                consuming: AtomicBool::new(false),
                token: CancellationToken::new(),
                subscription: OnceLock::new(),
                message_types: Mutex::new(Vec::new()),
                session: tokio::sync::Mutex::new(None),
            }),
            worker: tokio::sync::Mutex::new(None),
        })
    }

    /// 声明拓扑并开始消费；首次连接失败直接返回给调用方
    pub async fn start_consuming(
        &self,
        handler: Arc<dyn ConsumerEventHandler>,
        queue_name: &str,
        exclusive: Option<bool>,
        auto_delete: Option<bool>,
    ) -> BusResult<()> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() || self.inner.subscription.get().is_some() {
            return Err(BusError::AlreadyConsuming);
        }

        let topology = QueueTopology::new(&self.inner.settings, queue_name, exclusive, auto_delete);
        let mut session = self.inner.session.lock().await;
        let (opened, stream) = self
            .inner
            .open_session(&topology, self.inner.settings.queue.purge_on_startup)
            .await?;
        let channel = opened.channel.clone();
        *session = Some(opened);

        let subscription = Arc::new(Subscription { handler, topology });
        // worker 锁保证此处不会重复设置
        let _ = self.inner.subscription.set(subscription.clone());
        self.inner.consuming.store(true, Ordering::SeqCst);
        drop(session);

        *worker = Some(tokio::spawn(
            self.inner.clone().run(subscription, channel, stream),
        ));
        Ok(())
    }

    /// 订阅消息类型：声明同名扇出交换机并绑定到工作队列；启动前后均可调用
    pub async fn consume_message_type(&self, type_name: &str) {
        let session = self.inner.session.lock().await;
        {
            let mut types = self
                .inner
                .message_types
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !types.iter().any(|t| t == type_name) {
                types.push(type_name.to_string());
            }
        }

        if let (Some(session), Some(subscription)) =
            (session.as_ref(), self.inner.subscription.get())
        {
            subscription
                .topology
                .declare_message_type(session.channel.as_ref(), type_name, &self.inner.span)
                .await;
        }
    }

    /// 停止消费：抑制重连，等待进行中的投递处理完毕后释放信道与连接
    pub async fn stop_consuming(&self) -> BusResult<()> {
        let mut worker = self.worker.lock().await;
        let Some(task) = worker.take() else {
            return if self.inner.connection_closed.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(BusError::NotConsuming)
            };
        };

        self.inner.connection_closed.store(true, Ordering::SeqCst);
        self.inner.token.cancel();
        let _ = task.await;
        self.inner.release_session().await;

        tracing::debug!(parent: &self.inner.span, "disposing message bus consumer");
        Ok(())
    }

    /// 当前连接（或下一次重连）使用的主机
    pub fn active_host(&self) -> &str {
        self.inner.active_host()
    }

    pub fn is_consuming(&self) -> bool {
        self.inner.consuming.load(Ordering::SeqCst)
    }

    pub fn topology(&self) -> Option<&QueueTopology> {
        self.inner.subscription.get().map(|s| &s.topology)
    }
}

impl Drop for Consumer {
    /// 未调用 `stop_consuming` 就被丢弃时：取消消费，并在运行时内等待进行中的投递后释放会话
    fn drop(&mut self) {
        self.inner.connection_closed.store(true, Ordering::SeqCst);
        self.inner.token.cancel();

        let Some(task) = self.worker.get_mut().take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = self.inner.clone();
                runtime.spawn(async move {
                    let _ = task.await;
                    inner.release_session().await;
                });
            }
            Err(_) => {
                tracing::warn!(parent: &self.inner.span, "consumer dropped outside a runtime, session not released");
            }
        }
    }
}

impl Inner {
    fn active_host(&self) -> &str {
        let idx = self.active_host.load(Ordering::SeqCst);
        self.hosts
            .get(idx)
            .or_else(|| self.hosts.first())
            .map_or("", String::as_str)
    }

    /// 多主机时轮转到下一台（越过末尾回到 0）
    fn advance_host(&self) {
        if self.hosts.len() > 1 {
            let len = self.hosts.len();
            let _ = self
                .active_host
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |i| Some((i + 1) % len));
        }
    }

    /// 建立连接、信道，声明拓扑与已订阅的消息类型，然后订阅工作队列
    async fn open_session(
        &self,
        topology: &QueueTopology,
        purge: bool,
    ) -> BusResult<(Session, DeliveryStream)> {
        let params = ConnectionParams {
            host: self.active_host().to_string(),
            username: self.settings.username.clone(),
            password: self.settings.password.clone(),
            heartbeat: self.settings.heartbeat(),
        };
        tracing::debug!(parent: &self.span, queue = %topology.work_queue, host = %params.host, "creating consumer");

        let connection = self.connector.connect(&params).await?;
        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close().await;
                return Err(e);
            }
        };

        topology.declare(channel.as_ref(), purge, &self.span).await;

        let types = self
            .message_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for type_name in &types {
            topology
                .declare_message_type(channel.as_ref(), type_name, &self.span)
                .await;
        }

        let consumer_tag = format!("{}-{}", topology.work_queue, Uuid::new_v4());
        let stream = match channel
            .basic_consume(&topology.work_queue, &consumer_tag)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                let _ = channel.close().await;
                let _ = connection.close().await;
                return Err(e);
            }
        };

        tracing::debug!(parent: &self.span, queue = %topology.work_queue, "started consuming");
        Ok((Session { connection, channel }, stream))
    }

    async fn release_session(&self) {
        self.consuming.store(false, Ordering::SeqCst);
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        if let Err(e) = session.channel.close().await {
            tracing::debug!(parent: &self.span, error = %e, "error closing channel");
        }
        if let Err(e) = session.connection.close().await {
            tracing::debug!(parent: &self.span, error = %e, "error closing connection");
        }
    }

    async fn run(
        self: Arc<Self>,
        subscription: Arc<Subscription>,
        mut channel: Arc<dyn Channel>,
        mut stream: DeliveryStream,
    ) {
        loop {
            let Some(reason) = self.consume(&subscription, channel.as_ref(), &mut stream).await
            else {
                break;
            };

            self.consuming.store(false, Ordering::SeqCst);
            if self.connection_closed.load(Ordering::SeqCst) {
                tracing::debug!(parent: &self.span, "heartbeat missed but connection has been closed so not reconnecting");
                break;
            }

            tracing::warn!(parent: &self.span, reason = %reason, "connection lost");
            self.release_session().await;
            self.advance_host();
            tracing::debug!(parent: &self.span, host = self.active_host(), "heartbeat missed reconnecting to queue");

            match self.reconnect(&subscription.topology).await {
                Some((next_channel, next_stream)) => {
                    channel = next_channel;
                    stream = next_stream;
                }
                None => break,
            }
        }
    }

    /// 逐条处理投递，直到取消（None）或连接丢失（Some）
    async fn consume(
        &self,
        subscription: &Subscription,
        channel: &dyn Channel,
        stream: &mut DeliveryStream,
    ) -> Option<BusError> {
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                next = stream.next() => match next {
                    Some(Ok(delivery)) => self.handle_delivery(subscription, channel, delivery).await,
                    Some(Err(e)) => return Some(e),
                    None => return Some(BusError::connection_lost("delivery stream ended")),
                },
            }
        }
    }

    /// 固定间隔无限重连，直到成功或被停止
    async fn reconnect(&self, topology: &QueueTopology) -> Option<(Arc<dyn Channel>, DeliveryStream)> {
        let interval = self.settings.reconnect_interval();
        loop {
            let mut session = tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                guard = self.session.lock() => guard,
            };

            let opened = tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                opened = self.open_session(topology, false) => opened,
            };

            match opened {
                Ok((opened, stream)) => {
                    let channel = opened.channel.clone();
                    *session = Some(opened);
                    self.consuming.store(true, Ordering::SeqCst);
                    tracing::info!(parent: &self.span, host = self.active_host(), "reconnected to queue");
                    return Some((channel, stream));
                }
                Err(e) => {
                    tracing::error!(parent: &self.span, host = self.active_host(), error = %e, "error connecting to queue");
                }
            }
            drop(session);

            tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn handle_delivery(&self, subscription: &Subscription, channel: &dyn Channel, delivery: Delivery) {
        let Delivery {
            delivery_tag,
            mut envelope,
            ..
        } = delivery;

        let headers = envelope.headers_mut();
        headers.stamp(header::TIME_RECEIVED, Utc::now());
        headers.set_or_clear(header::DESTINATION_MACHINE, self.settings.machine_name.as_str());
        headers.set_or_clear(
            header::DESTINATION_ADDRESS,
            subscription.topology.work_queue.as_str(),
        );

        let result = self.invoke(subscription.handler.as_ref(), &envelope).await;
        envelope
            .headers_mut()
            .stamp(header::TIME_PROCESSED, Utc::now());

        let settled = if result.success {
            self.settle_success(&subscription.topology, channel, delivery_tag, &envelope)
                .await
        } else {
            self.settle_failure(
                &subscription.topology,
                channel,
                delivery_tag,
                envelope,
                result.exception,
            )
            .await
        };

        if let Err(e) = settled {
            tracing::error!(parent: &self.span, delivery_tag, error = %e, "error settling delivery");
        }
    }

    /// 调用处理器；缺少类型头、处理器 panic 都被转换为失败结果
    async fn invoke(&self, handler: &dyn ConsumerEventHandler, envelope: &Envelope) -> ConsumeEventResult {
        let Some(type_name) = envelope.headers().full_type_name() else {
            tracing::error!(parent: &self.span, message_id = ?envelope.message_id(), "error processing message, message headers must contain FullTypeName");
            return ConsumeEventResult::failed(BusError::MissingTypeHeader);
        };

        let call = handler.handle(envelope.body(), &type_name, envelope.headers());
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(parent: &self.span, type_name = %type_name, panic = %message, "handler panicked");
                ConsumeEventResult::failed(HandlerError::new("panic", message).with_source(type_name))
            }
        }
    }

    async fn settle_success(
        &self,
        topology: &QueueTopology,
        channel: &dyn Channel,
        delivery_tag: u64,
        envelope: &Envelope,
    ) -> BusResult<()> {
        channel.basic_ack(delivery_tag).await?;

        if let Some(audit) = &topology.audit_exchange {
            if let Err(e) = channel.basic_publish(audit, "", envelope).await {
                tracing::warn!(parent: &self.span, message_id = ?envelope.message_id(), error = %e, "error publishing audit copy");
            }
        }
        Ok(())
    }

    async fn settle_failure(
        &self,
        topology: &QueueTopology,
        channel: &dyn Channel,
        delivery_tag: u64,
        mut envelope: Envelope,
        exception: Option<HandlerError>,
    ) -> BusResult<()> {
        let retry_count = envelope.headers().retry_count();

        if retry_count < self.settings.max_retries {
            envelope
                .headers_mut()
                .set_or_clear(header::RETRY_COUNT, retry_count + 1);
            return self
                .publish_then_ack(channel, delivery_tag, "", &topology.retry_queue, &envelope)
                .await;
        }

        let exception = exception.unwrap_or_else(|| {
            HandlerError::from(BusError::HandlerExecution {
                message: "handler reported failure without an exception".to_string(),
            })
        });
        self.attach_exception(&mut envelope, &exception);

        let exceeded = BusError::MaxRetriesExceeded { retry_count };
        tracing::error!(parent: &self.span, message_id = ?envelope.message_id(), error = %exceeded, exception = %exception, "max number of retries exceeded");

        if self.settings.disable_errors {
            return channel.basic_ack(delivery_tag).await;
        }
        self.publish_then_ack(channel, delivery_tag, &topology.error_exchange, "", &envelope)
            .await
    }

    /// 发布被确认后才确认原投递。未确认时按固定间隔只重试这次发布，不再调用处理器；
    /// 连接丢失时直接返回，未确认的投递由 broker 重新入队；停止时退回队列
    async fn publish_then_ack(
        &self,
        channel: &dyn Channel,
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> BusResult<()> {
        let interval = self.settings.reconnect_interval();
        loop {
            match channel.basic_publish(exchange, routing_key, envelope).await {
                Ok(()) => return channel.basic_ack(delivery_tag).await,
                Err(e) if e.is_connection_error() => return Err(e),
                Err(e) => {
                    tracing::warn!(parent: &self.span, exchange, routing_key, error = %e, "publish not confirmed, retrying");
                }
            }

            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    tracing::debug!(parent: &self.span, delivery_tag, "stopping with unconfirmed publish, returning delivery to queue");
                    return channel.basic_nack(delivery_tag, true).await;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    fn attach_exception(&self, envelope: &mut Envelope, exception: &HandlerError) {
        let raw = serde_json::to_string(exception).unwrap_or_else(|e| {
            tracing::warn!(parent: &self.span, error = %e, "error serializing exception");
            String::new()
        });

        match ExceptionHeader::new(exception, Utc::now(), raw).to_json() {
            Ok(json) => envelope.headers_mut().set_or_clear(header::EXCEPTION, json),
            Err(e) => {
                tracing::warn!(parent: &self.span, error = %e, "error serializing exception header");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::inmemory::InMemoryBroker;

    #[test]
    fn panic_payloads_are_rendered() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "handler panicked");
    }

    #[test]
    fn empty_host_list_is_rejected() {
        let settings = TransportSettings::builder().host(" , ").build();
        let result = Consumer::new(settings, Arc::new(InMemoryBroker::default()), Span::none());
        assert!(matches!(result, Err(BusError::InvalidSettings { .. })));
    }

    #[test]
    fn host_rotation_wraps() {
        let settings = TransportSettings::builder().host("a,b,c").build();
        let consumer =
            Consumer::new(settings, Arc::new(InMemoryBroker::default()), Span::none()).unwrap();
        let seen: Vec<String> = (0..4)
            .map(|_| {
                let host = consumer.active_host().to_string();
                consumer.inner.advance_host();
                host
            })
            .collect();
        assert_eq!(seen, vec!["a", "b", "c", "a"]);
    }

    #[tokio::test]
    async fn stop_without_start_is_reported() {
        let consumer = Consumer::new(
            TransportSettings::default(),
            Arc::new(InMemoryBroker::default()),
            Span::none(),
        )
        .unwrap();
        assert!(matches!(
            consumer.stop_consuming().await,
            Err(BusError::NotConsuming)
        ));
        assert!(!consumer.is_consuming());
        assert!(consumer.topology().is_none());
    }
}
