//! 流程管理器（Saga）关联存储协议
//!
//! 以关联 ID 为键保存不透明的状态负载，保证同一关联 ID 至多一条存活记录：
//! - 插入要求不存在（否则 `DuplicateCorrelationId`）；
//! - 更新要求已存在（否则 `CorrelationNotFound`）；
//! - 查找与删除对缺失键是全函数（查找返回 `None`，删除为空操作）。
//!
//! `ProcessManagerFinder` 只处理序列化后的条目，便于替换为持久化实现；
//! `ProcessManagerFinderExt` 在其上提供按具体类型读写的便捷方法。
//!
use crate::{
    error::{BusError, BusResult as Result},
    message::MessageType,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// 流程管理器状态数据
pub trait ProcessManagerData: MessageType {
    fn correlation_id(&self) -> Uuid;
}

/// 关联条目：关联 ID + 逻辑类型标记 + 不透明负载
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessManagerEntry {
    correlation_id: Uuid,
    type_name: String,
    payload: Value,
}

impl ProcessManagerEntry {
    pub fn new(correlation_id: Uuid, type_name: impl Into<String>, payload: Value) -> Self {
        Self {
            correlation_id,
            type_name: type_name.into(),
            payload,
        }
    }

    pub fn from_data<T: ProcessManagerData>(data: &T) -> Result<Self> {
        Ok(Self::new(
            data.correlation_id(),
            T::TYPE_NAME,
            serde_json::to_value(data)?,
        ))
    }

    /// 还原为具体类型；类型标记不一致时返回 `TypeMismatch`
    pub fn to_data<T: ProcessManagerData>(&self) -> Result<T> {
        if self.type_name != T::TYPE_NAME {
            return Err(BusError::TypeMismatch {
                expected: T::TYPE_NAME.to_string(),
                found: self.type_name.clone(),
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

/// 关联存储：必须在多个处理上下文并发调用下保持一致
#[async_trait]
pub trait ProcessManagerFinder: Send + Sync {
    async fn insert_entry(&self, entry: ProcessManagerEntry) -> Result<()>;

    async fn update_entry(&self, entry: ProcessManagerEntry) -> Result<()>;

    async fn find_entry(&self, correlation_id: Uuid) -> Result<Option<ProcessManagerEntry>>;

    async fn delete_entry(&self, correlation_id: Uuid) -> Result<()>;
}

#[async_trait]
impl<T> ProcessManagerFinder for Arc<T>
where
    T: ProcessManagerFinder + ?Sized,
{
    async fn insert_entry(&self, entry: ProcessManagerEntry) -> Result<()> {
        (**self).insert_entry(entry).await
    }

    async fn update_entry(&self, entry: ProcessManagerEntry) -> Result<()> {
        (**self).update_entry(entry).await
    }

    async fn find_entry(&self, correlation_id: Uuid) -> Result<Option<ProcessManagerEntry>> {
        (**self).find_entry(correlation_id).await
    }

    async fn delete_entry(&self, correlation_id: Uuid) -> Result<()> {
        (**self).delete_entry(correlation_id).await
    }
}

/// 按具体类型读写的便捷方法
#[async_trait]
pub trait ProcessManagerFinderExt: ProcessManagerFinder {
    async fn insert_data<T: ProcessManagerData>(&self, data: &T) -> Result<()> {
        self.insert_entry(ProcessManagerEntry::from_data(data)?)
            .await
    }

    async fn update_data<T: ProcessManagerData>(&self, data: &T) -> Result<()> {
        self.update_entry(ProcessManagerEntry::from_data(data)?)
            .await
    }

    async fn find_data<T: ProcessManagerData>(&self, correlation_id: Uuid) -> Result<Option<T>> {
        match self.find_entry(correlation_id).await? {
            Some(entry) => entry.to_data::<T>().map(Some),
            None => Ok(None),
        }
    }

    async fn delete_data<T: ProcessManagerData>(&self, data: &T) -> Result<()> {
        self.delete_entry(data.correlation_id()).await
    }
}

impl<F> ProcessManagerFinderExt for F where F: ProcessManagerFinder + ?Sized {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderSaga {
        id: Uuid,
        step: u32,
    }

    impl MessageType for OrderSaga {
        const TYPE_NAME: &'static str = "Sagas.OrderSaga";
    }

    impl ProcessManagerData for OrderSaga {
        fn correlation_id(&self) -> Uuid {
            self.id
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct OtherSaga {
        id: Uuid,
    }

    impl MessageType for OtherSaga {
        const TYPE_NAME: &'static str = "Sagas.OtherSaga";
    }

    impl ProcessManagerData for OtherSaga {
        fn correlation_id(&self) -> Uuid {
            self.id
        }
    }

    #[test]
    fn entry_carries_type_tag() {
        let saga = OrderSaga {
            id: Uuid::new_v4(),
            step: 2,
        };
        let entry = ProcessManagerEntry::from_data(&saga).unwrap();
        assert_eq!(entry.correlation_id(), saga.id);
        assert_eq!(entry.type_name(), "Sagas.OrderSaga");
        assert_eq!(entry.to_data::<OrderSaga>().unwrap(), saga);

        assert!(matches!(
            entry.to_data::<OtherSaga>(),
            Err(BusError::TypeMismatch { .. })
        ));
    }
}
