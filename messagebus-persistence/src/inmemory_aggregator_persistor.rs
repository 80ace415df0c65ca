use async_trait::async_trait;
use dashmap::DashMap;
use messagebus_core::{aggregator::AggregatorPersistor, error::BusResult};
use serde_json::Value;

/// 基于内存的聚合缓冲区
/// - 按消息类型名分桶，桶内保持插入顺序
/// - `take_all` 直接移除整个桶，插入与取出在同一分片锁下互斥
#[derive(Default)]
pub struct InMemoryAggregatorPersistor {
    buffers: DashMap<String, Vec<Value>>,
}

impl InMemoryAggregatorPersistor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AggregatorPersistor for InMemoryAggregatorPersistor {
    async fn insert_data(&self, type_name: &str, data: Value) -> BusResult<()> {
        self.buffers
            .entry(type_name.to_string())
            .or_default()
            .push(data);
        Ok(())
    }

    async fn get_data(&self, type_name: &str) -> BusResult<Vec<Value>> {
        Ok(self
            .buffers
            .get(type_name)
            .map(|b| b.value().clone())
            .unwrap_or_default())
    }

    async fn count(&self, type_name: &str) -> BusResult<usize> {
        Ok(self.buffers.get(type_name).map_or(0, |b| b.len()))
    }

    async fn take_all(&self, type_name: &str) -> BusResult<Vec<Value>> {
        Ok(self
            .buffers
            .remove(type_name)
            .map(|(_, batch)| batch)
            .unwrap_or_default())
    }

    async fn remove_all(&self, type_name: &str) -> BusResult<()> {
        self.buffers.remove(type_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn take_all_drains_in_insertion_order() {
        let p = InMemoryAggregatorPersistor::new();
        p.insert_data("A", json!(1)).await.unwrap();
        p.insert_data("A", json!(2)).await.unwrap();
        p.insert_data("B", json!("b")).await.unwrap();

        assert_eq!(p.count("A").await.unwrap(), 2);
        assert_eq!(p.get_data("A").await.unwrap(), vec![json!(1), json!(2)]);
        assert_eq!(p.take_all("A").await.unwrap(), vec![json!(1), json!(2)]);
        assert_eq!(p.count("A").await.unwrap(), 0);
        assert!(p.take_all("A").await.unwrap().is_empty());
        assert_eq!(p.count("B").await.unwrap(), 1);

        p.remove_all("B").await.unwrap();
        assert_eq!(p.count("B").await.unwrap(), 0);
    }
}
