//! 消息信封（Envelope）与消息头（Headers）
//!
//! 信封由不透明的字节负载与字符串键的消息头组成。消息头提供显式的
//! “设置或清除”操作：写入零值（空串、0、false、空字节）即移除该键。
//!
use bon::Builder;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 管道使用的消息头键
pub mod header {
    pub const FULL_TYPE_NAME: &str = "FullTypeName";
    pub const TIME_RECEIVED: &str = "TimeReceived";
    pub const TIME_PROCESSED: &str = "TimeProcessed";
    pub const DESTINATION_MACHINE: &str = "DestinationMachine";
    pub const DESTINATION_ADDRESS: &str = "DestinationAddress";
    pub const RETRY_COUNT: &str = "RetryCount";
    pub const EXCEPTION: &str = "Exception";
}

/// 消息头取值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    String(String),
    Bytes(Vec<u8>),
}

impl HeaderValue {
    /// 是否为该类型的零值
    pub fn is_zero(&self) -> bool {
        match self {
            HeaderValue::Bool(b) => !*b,
            HeaderValue::Int(i) => *i == 0,
            HeaderValue::String(s) => s.is_empty(),
            HeaderValue::Bytes(b) => b.is_empty(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            HeaderValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// 文本取值：字符串原样返回，字节数组按 UTF-8 解码
    pub fn as_text(&self) -> Option<String> {
        match self {
            HeaderValue::String(s) => Some(s.clone()),
            HeaderValue::Bytes(b) => String::from_utf8(b.clone()).ok(),
            _ => None,
        }
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        HeaderValue::Int(i64::from(value))
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Int(i64::from(value))
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<Vec<u8>> for HeaderValue {
    fn from(value: Vec<u8>) -> Self {
        HeaderValue::Bytes(value)
    }
}

/// 字符串键的消息头集合
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, HeaderValue>);

/// 队列声明参数与消息头共用同一结构
pub type FieldTable = Headers;

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// 无条件写入
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// 设置或清除：零值视为移除该键，而不是存储零值
    pub fn set_or_clear(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        let key = key.into();
        let value = value.into();
        if value.is_zero() {
            self.0.remove(&key);
        } else {
            self.0.insert(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HeaderValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 重试次数，缺省为 0
    pub fn retry_count(&self) -> u32 {
        self.get(header::RETRY_COUNT)
            .and_then(HeaderValue::as_int)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    }

    pub fn full_type_name(&self) -> Option<String> {
        self.get(header::FULL_TYPE_NAME)
            .and_then(HeaderValue::as_text)
            .filter(|s| !s.is_empty())
    }

    /// 写入 ISO-8601 时间戳
    pub fn stamp(&mut self, key: &str, at: DateTime<Utc>) {
        self.set_or_clear(key, at.to_rfc3339_opts(SecondsFormat::Micros, true));
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<HeaderValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl IntoIterator for Headers {
    type Item = (String, HeaderValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, HeaderValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// 消息信封：字节负载 + 消息头
#[derive(Debug, Clone, Default, PartialEq, Eq, Builder, Serialize, Deserialize)]
pub struct Envelope {
    message_id: Option<String>,
    #[builder(default)]
    body: Vec<u8>,
    #[builder(default)]
    headers: Headers,
}

impl Envelope {
    pub fn new(body: Vec<u8>, headers: Headers) -> Self {
        Self {
            message_id: None,
            body,
            headers,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_or_clear_removes_zero_values() {
        let mut headers = Headers::new();
        headers.set_or_clear(header::RETRY_COUNT, 2u32);
        assert_eq!(headers.retry_count(), 2);

        headers.set_or_clear(header::RETRY_COUNT, 0u32);
        assert!(!headers.contains(header::RETRY_COUNT));
        assert_eq!(headers.retry_count(), 0);

        headers.set_or_clear("Flag", true);
        headers.set_or_clear("Flag", false);
        headers.set_or_clear(header::DESTINATION_MACHINE, "");
        assert!(headers.is_empty());
    }

    #[test]
    fn full_type_name_accepts_text_and_bytes() {
        let mut headers = Headers::new();
        assert_eq!(headers.full_type_name(), None);

        headers.insert(header::FULL_TYPE_NAME, b"Orders.Placed".to_vec());
        assert_eq!(headers.full_type_name().as_deref(), Some("Orders.Placed"));

        headers.insert(header::FULL_TYPE_NAME, "Orders.Shipped");
        assert_eq!(headers.full_type_name().as_deref(), Some("Orders.Shipped"));
    }

    #[test]
    fn retry_count_tolerates_text_and_garbage() {
        let mut headers = Headers::new();
        headers.insert(header::RETRY_COUNT, "3");
        assert_eq!(headers.retry_count(), 3);
        headers.insert(header::RETRY_COUNT, -1i64);
        assert_eq!(headers.retry_count(), 0);
    }

    #[test]
    fn stamp_writes_utc_iso8601() {
        let mut headers = Headers::new();
        let at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        headers.stamp(header::TIME_RECEIVED, at);
        assert_eq!(
            headers.get(header::TIME_RECEIVED),
            Some(&HeaderValue::String("2024-05-01T10:00:00.000000Z".into()))
        );
    }

    #[test]
    fn envelope_builder_defaults() {
        let env = Envelope::builder().message_id("m-1".into()).build();
        assert_eq!(env.message_id(), Some("m-1"));
        assert!(env.body().is_empty());
        assert!(env.headers().is_empty());
    }
}
