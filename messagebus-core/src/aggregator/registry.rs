use super::Aggregator;
use crate::{
    error::{BusError, BusResult},
    message::MessageType,
};
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::HashMap, marker::PhantomData, sync::Arc};

/// 类型擦除后的聚合处理器，批量负载以 JSON 形式传入
#[async_trait]
pub(crate) trait ErasedAggregator: Send + Sync {
    fn handler_name(&self) -> &str;

    async fn execute_values(&self, batch: Vec<Value>) -> BusResult<()>;
}

struct TypedAggregator<T, A: ?Sized> {
    inner: Arc<A>,
    _marker: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, A> ErasedAggregator for TypedAggregator<T, A>
where
    T: MessageType,
    A: Aggregator<T> + ?Sized,
{
    fn handler_name(&self) -> &str {
        self.inner.handler_name()
    }

    async fn execute_values(&self, batch: Vec<Value>) -> BusResult<()> {
        let items = batch
            .into_iter()
            .map(serde_json::from_value::<T>)
            .collect::<Result<Vec<_>, _>>()?;

        self.inner
            .execute(items)
            .await
            .map_err(|e| BusError::BatchHandler {
                handler: self.inner.handler_name().to_string(),
                reason: format!("{e:#}"),
            })
    }
}

type ResolveFn = Arc<dyn Fn() -> Arc<dyn ErasedAggregator> + Send + Sync>;

/// 聚合处理器注册表：消息类型标记 -> 处理器解析函数
///
/// 注册在启动阶段完成，刷新时每次通过解析函数获取一个处理器实例。
#[derive(Clone, Default)]
pub struct AggregatorRegistry {
    by_type: HashMap<&'static str, ResolveFn>,
}

impl AggregatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为消息类型 `T` 注册聚合处理器的解析函数
    pub fn register<T, A, F>(&mut self, resolve: F) -> BusResult<()>
    where
        T: MessageType,
        A: Aggregator<T> + 'static,
        F: Fn() -> Arc<A> + Send + Sync + 'static,
    {
        if self.by_type.contains_key(T::TYPE_NAME) {
            return Err(BusError::AggregatorAlreadyRegistered {
                type_name: T::TYPE_NAME.to_string(),
            });
        }

        let f: ResolveFn = Arc::new(move || {
            Arc::new(TypedAggregator::<T, A> {
                inner: resolve(),
                _marker: PhantomData,
            }) as Arc<dyn ErasedAggregator>
        });
        self.by_type.insert(T::TYPE_NAME, f);

        Ok(())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.by_type.contains_key(type_name)
    }

    pub(crate) fn resolve(&self, type_name: &str) -> BusResult<Arc<dyn ErasedAggregator>> {
        self.by_type
            .get(type_name)
            .map(|f| f())
            .ok_or_else(|| BusError::AggregatorNotRegistered {
                type_name: type_name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Tick {
        n: u32,
    }

    impl MessageType for Tick {
        const TYPE_NAME: &'static str = "Metrics.Tick";
    }

    #[derive(Default)]
    struct Sum {
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Aggregator<Tick> for Sum {
        fn handler_name(&self) -> &str {
            "sum"
        }

        async fn execute(&self, batch: Vec<Tick>) -> anyhow::Result<()> {
            if batch.iter().any(|t| t.n == 0) {
                anyhow::bail!("zero tick");
            }
            self.seen.lock().unwrap().extend(batch.iter().map(|t| t.n));
            Ok(())
        }
    }

    #[tokio::test]
    async fn resolves_and_decodes_batches() {
        let sum = Arc::new(Sum::default());
        let mut registry = AggregatorRegistry::new();
        let shared = sum.clone();
        registry.register::<Tick, _, _>(move || shared.clone()).unwrap();

        let agg = registry.resolve(Tick::TYPE_NAME).unwrap();
        assert_eq!(agg.handler_name(), "sum");
        agg.execute_values(vec![serde_json::json!({"n": 1}), serde_json::json!({"n": 2})])
            .await
            .unwrap();
        assert_eq!(*sum.seen.lock().unwrap(), vec![1, 2]);

        let err = agg
            .execute_values(vec![serde_json::json!({"n": 0})])
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::BatchHandler { ref handler, .. } if handler == "sum"));

        let err = agg
            .execute_values(vec![serde_json::json!({"bad": true})])
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Serde { .. }));
    }

    #[test]
    fn rejects_duplicates_and_unknown_types() {
        let mut registry = AggregatorRegistry::new();
        registry
            .register::<Tick, _, _>(|| Arc::new(Sum::default()))
            .unwrap();
        assert!(matches!(
            registry.register::<Tick, _, _>(|| Arc::new(Sum::default())),
            Err(BusError::AggregatorAlreadyRegistered { .. })
        ));
        assert!(matches!(
            registry.resolve("Unknown"),
            Err(BusError::AggregatorNotRegistered { .. })
        ));
    }
}
