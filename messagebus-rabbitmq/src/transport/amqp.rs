//! 基于 lapin 的 AMQP 0-9-1 传输（feature `amqp`）
//!
//! - 连接使用配置中的凭据与心跳间隔，主机可带端口（`host:port`）；
//! - 信道开启 publisher confirms，`basic_publish` 在 broker ack 之后才返回 Ok，nack 视为发布失败；
//! - 预取为 1，与投递管道逐条处理一致；
//! - 连接错误回调、消费流出错或结束都表现为 `ConnectionLost`。
//!
use super::{
    Channel, Connection, ConnectionParams, Connector, Delivery, DeliveryStream, ExchangeKind,
    ExchangeOptions, QueueOptions,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    QueuePurgeOptions,
};
use lapin::types::{AMQPValue, ByteArray, FieldTable as AmqpTable, LongString, ShortString};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, ConnectionProperties};
use messagebus_core::{BusError, Envelope, FieldTable, HeaderValue, Headers, error::BusResult as Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Span;

const DEFAULT_PORT: u16 = 5672;
const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// lapin 连接器
#[derive(Clone)]
pub struct AmqpConnector {
    span: Span,
}

impl AmqpConnector {
    pub fn new(span: Span) -> Self {
        Self { span }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn Connection>> {
        let connection = lapin::Connection::connect_uri(amqp_uri(params), ConnectionProperties::default())
            .await
            .map_err(|e| BusError::connection(&params.host, e))?;

        let lost = CancellationToken::new();
        let on_lost = lost.clone();
        let span = self.span.clone();
        let host = params.host.clone();
        connection.on_error(move |e| {
            tracing::warn!(parent: &span, host = %host, error = %e, "amqp connection error");
            on_lost.cancel();
        });

        tracing::debug!(parent: &self.span, host = %params.host, "amqp connection opened");
        Ok(Arc::new(AmqpConnection {
            inner: connection,
            host: params.host.clone(),
            lost,
        }))
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
    host: String,
    lost: CancellationToken,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| BusError::connection(&self.host, e))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::connection(&self.host, e))?;
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::connection(&self.host, e))?;

        Ok(Arc::new(AmqpChannel {
            inner: channel,
            lost: self.lost.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BusError::connection_lost(e))
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
    lost: CancellationToken,
}

impl AmqpChannel {
    /// 连接已断或信道/连接状态失效的错误归为连接丢失，其余交给 `otherwise`
    fn classify(&self, e: lapin::Error, otherwise: impl FnOnce(lapin::Error) -> BusError) -> BusError {
        let lost = self.lost.is_cancelled()
            || matches!(
                e,
                lapin::Error::InvalidChannelState(_)
                    | lapin::Error::InvalidConnectionState(_)
                    | lapin::Error::IOError(_)
            );
        if lost {
            BusError::connection_lost(e)
        } else {
            otherwise(e)
        }
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueOptions,
        arguments: &FieldTable,
    ) -> Result<()> {
        let options = QueueDeclareOptions {
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            ..QueueDeclareOptions::default()
        };
        self.inner
            .queue_declare(queue, options, to_amqp_table(arguments))
            .await
            .map(|_| ())
            .map_err(|e| self.classify(e, |e| BusError::topology(queue, e)))
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<()> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        let options = ExchangeDeclareOptions {
            durable: options.durable,
            auto_delete: options.auto_delete,
            ..ExchangeDeclareOptions::default()
        };
        self.inner
            .exchange_declare(exchange, kind, options, AmqpTable::default())
            .await
            .map_err(|e| self.classify(e, |e| BusError::topology(exchange, e)))
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                AmqpTable::default(),
            )
            .await
            .map_err(|e| self.classify(e, |e| BusError::topology(queue, e)))
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32> {
        self.inner
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|e| self.classify(e, |e| BusError::topology(queue, e)))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<()> {
        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                envelope.body(),
                properties_of(envelope),
            )
            .await
            .map_err(|e| self.classify(e, |e| BusError::publish(exchange, routing_key, e)))?;
        let confirmation = confirm
            .await
            .map_err(|e| self.classify(e, |e| BusError::publish(exchange, routing_key, e)))?;

        if confirmation.is_nack() {
            return Err(BusError::publish(
                exchange,
                routing_key,
                "publish was nacked by broker",
            ));
        }
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                AmqpTable::default(),
            )
            .await
            .map_err(|e| self.classify(e, |e| BusError::topology(queue, e)))?;

        let stream = consumer
            .map(|item| item.map(into_delivery).map_err(|e| BusError::connection_lost(e)))
            .take_until(self.lost.clone().cancelled_owned());
        Ok(Box::pin(stream))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BusError::connection_lost(e))
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        self.inner
            .basic_nack(delivery_tag, options)
            .await
            .map_err(|e| BusError::connection_lost(e))
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BusError::connection_lost(e))
    }
}

fn amqp_uri(params: &ConnectionParams) -> AMQPUri {
    let (host, port) = split_host_port(&params.host);
    let guest = AMQPUserInfo::default();
    // 心跳为 0 表示关闭
    let heartbeat = params
        .heartbeat
        .map_or(0, |d| u16::try_from(d.as_secs()).unwrap_or(u16::MAX));

    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: params.username.clone().unwrap_or(guest.username),
                password: params.password.clone().unwrap_or(guest.password),
            },
            host,
            port,
        },
        query: AMQPQueryString {
            heartbeat: Some(heartbeat),
            ..AMQPQueryString::default()
        },
        ..AMQPUri::default()
    }
}

fn split_host_port(host: &str) -> (String, u16) {
    match host.rsplit_once(':') {
        Some((name, port)) => match port.parse() {
            Ok(port) => (name.to_string(), port),
            Err(_) => (host.to_string(), DEFAULT_PORT),
        },
        None => (host.to_string(), DEFAULT_PORT),
    }
}

fn properties_of(envelope: &Envelope) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_headers(to_amqp_table(envelope.headers()));
    match envelope.message_id() {
        Some(id) => properties.with_message_id(ShortString::from(id.to_string())),
        None => properties,
    }
}

fn to_amqp_table(headers: &Headers) -> AmqpTable {
    let mut table = AmqpTable::default();
    for (key, value) in headers.iter() {
        table.insert(ShortString::from(key.clone()), to_amqp_value(value));
    }
    table
}

fn to_amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
        HeaderValue::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        HeaderValue::Bytes(b) => AMQPValue::ByteArray(ByteArray::from(b.clone())),
    }
}

/// 其它客户端常以字节形式发送字符串头；合法 UTF-8 还原为字符串，不支持的类型忽略
fn from_amqp_value(value: &AMQPValue) -> Option<HeaderValue> {
    let converted = match value {
        AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
        AMQPValue::ShortShortInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::ShortShortUInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::ShortInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::ShortUInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::LongInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::LongUInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::LongLongInt(i) => HeaderValue::Int(*i),
        AMQPValue::ShortString(s) => HeaderValue::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => match std::str::from_utf8(s.as_bytes()) {
            Ok(text) => HeaderValue::String(text.to_string()),
            Err(_) => HeaderValue::Bytes(s.as_bytes().to_vec()),
        },
        AMQPValue::ByteArray(b) => HeaderValue::Bytes(b.as_slice().to_vec()),
        _ => return None,
    };
    Some(converted)
}

fn from_amqp_table(table: &AmqpTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| from_amqp_value(value).map(|v| (key.as_str().to_string(), v)))
        .collect()
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(from_amqp_table)
        .unwrap_or_default();
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string());

    Delivery {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        envelope: Envelope::builder()
            .maybe_message_id(message_id)
            .body(delivery.data)
            .headers(headers)
            .build(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use messagebus_core::header;
    use std::time::Duration;

    fn params(host: &str) -> ConnectionParams {
        ConnectionParams {
            host: host.to_string(),
            username: Some("bus".to_string()),
            password: Some("secret".to_string()),
            heartbeat: Some(Duration::from_secs(120)),
        }
    }

    #[test]
    fn uri_carries_credentials_port_and_heartbeat() {
        let uri = amqp_uri(&params("rabbit-1:5673"));
        assert_eq!(uri.authority.host, "rabbit-1");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "bus");
        assert_eq!(uri.authority.userinfo.password, "secret");
        assert_eq!(uri.query.heartbeat, Some(120));

        let uri = amqp_uri(&ConnectionParams {
            heartbeat: None,
            username: None,
            password: None,
            ..params("rabbit-2")
        });
        assert_eq!(uri.authority.port, DEFAULT_PORT);
        assert_eq!(uri.authority.userinfo.username, AMQPUserInfo::default().username);
        assert_eq!(uri.query.heartbeat, Some(0));
    }

    #[test]
    fn headers_survive_the_wire_table() {
        let headers: Headers = [
            (header::FULL_TYPE_NAME, HeaderValue::from("Orders.OrderPlaced")),
            (header::RETRY_COUNT, HeaderValue::from(2_i64)),
            ("flag", HeaderValue::from(true)),
            ("raw", HeaderValue::from(vec![0xff_u8, 0x00])),
        ]
        .into_iter()
        .collect();

        assert_eq!(from_amqp_table(&to_amqp_table(&headers)), headers);
    }

    #[test]
    fn foreign_header_encodings_are_normalized() {
        let mut table = AmqpTable::default();
        table.insert(
            ShortString::from("FullTypeName"),
            AMQPValue::LongString(LongString::from("Orders.OrderPlaced")),
        );
        table.insert(ShortString::from("RetryCount"), AMQPValue::LongInt(3));
        table.insert(ShortString::from("ignored"), AMQPValue::Void);

        let headers = from_amqp_table(&table);
        assert_eq!(headers.full_type_name().as_deref(), Some("Orders.OrderPlaced"));
        assert_eq!(headers.retry_count(), 3);
        assert!(!headers.contains("ignored"));
    }

    #[test]
    fn published_properties_are_persistent_with_message_id() {
        let envelope = Envelope::builder()
            .message_id("m-1".to_string())
            .body(b"{}".to_vec())
            .build();
        let properties = properties_of(&envelope);
        assert_eq!(*properties.delivery_mode(), Some(PERSISTENT));
        assert_eq!(
            properties.message_id().as_ref().map(|id| id.as_str()),
            Some("m-1")
        );
    }
}
