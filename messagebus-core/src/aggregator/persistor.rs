//! 聚合缓冲区存储协议
//!
//! 插入与刷新必须互斥：刷新不会看到半完成的插入，插入也不会看到半完成的刷新；
//! `take_all` 作为单个原子步骤读取并清空缓冲区。
//!
use crate::{error::BusResult as Result, message::MessageType};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

#[async_trait]
pub trait AggregatorPersistor: Send + Sync {
    /// 追加一条待聚合负载
    async fn insert_data(&self, type_name: &str, data: Value) -> Result<()>;

    /// 读取（不移除）当前缓冲的负载
    async fn get_data(&self, type_name: &str) -> Result<Vec<Value>>;

    async fn count(&self, type_name: &str) -> Result<usize>;

    /// 原子地取出并清空缓冲区
    async fn take_all(&self, type_name: &str) -> Result<Vec<Value>>;

    async fn remove_all(&self, type_name: &str) -> Result<()>;
}

#[async_trait]
impl<T> AggregatorPersistor for Arc<T>
where
    T: AggregatorPersistor + ?Sized,
{
    async fn insert_data(&self, type_name: &str, data: Value) -> Result<()> {
        (**self).insert_data(type_name, data).await
    }

    async fn get_data(&self, type_name: &str) -> Result<Vec<Value>> {
        (**self).get_data(type_name).await
    }

    async fn count(&self, type_name: &str) -> Result<usize> {
        (**self).count(type_name).await
    }

    async fn take_all(&self, type_name: &str) -> Result<Vec<Value>> {
        (**self).take_all(type_name).await
    }

    async fn remove_all(&self, type_name: &str) -> Result<()> {
        (**self).remove_all(type_name).await
    }
}

/// 按消息类型写入缓冲区的入口，供消息处理器调用
#[async_trait]
pub trait AggregatorPersistorExt: AggregatorPersistor {
    async fn insert_message<T: MessageType>(&self, message: &T) -> Result<()> {
        self.insert_data(T::TYPE_NAME, serde_json::to_value(message)?)
            .await
    }
}

impl<P> AggregatorPersistorExt for P where P: AggregatorPersistor + ?Sized {}
