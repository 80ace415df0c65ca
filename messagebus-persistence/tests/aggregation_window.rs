use anyhow::Result as AnyResult;
use async_trait::async_trait;
use messagebus_core::aggregator::{
    Aggregator, AggregatorPersistor, AggregatorPersistorExt, AggregatorRegistry, AggregatorTimer,
};
use messagebus_core::message::MessageType;
use messagebus_persistence::InMemoryAggregatorPersistor;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::Span;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PriceChanged {
    sku: String,
    seq: u32,
}

impl MessageType for PriceChanged {
    const TYPE_NAME: &'static str = "Catalog.PriceChanged";
}

#[derive(Default)]
struct PriceBatcher {
    batches: Mutex<Vec<Vec<PriceChanged>>>,
    invocations: AtomicUsize,
}

#[async_trait]
impl Aggregator<PriceChanged> for PriceBatcher {
    fn handler_name(&self) -> &str {
        "price-batcher"
    }

    async fn execute(&self, batch: Vec<PriceChanged>) -> anyhow::Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }
}

fn timer_for(
    persistor: Arc<InMemoryAggregatorPersistor>,
    batcher: Arc<PriceBatcher>,
) -> AggregatorTimer {
    let mut registry = AggregatorRegistry::new();
    registry
        .register::<PriceChanged, _, _>(move || batcher.clone())
        .unwrap();
    AggregatorTimer::new(persistor, Arc::new(registry), Span::none())
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    let _ = tokio::time::timeout(Duration::from_secs(3), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn one_window_delivers_both_items_once() -> AnyResult<()> {
    let persistor = Arc::new(InMemoryAggregatorPersistor::new());
    let batcher = Arc::new(PriceBatcher::default());
    let mut timer = timer_for(persistor.clone(), batcher.clone());

    for seq in 0..2 {
        persistor
            .insert_message(&PriceChanged {
                sku: "sku-1".into(),
                seq,
            })
            .await?;
    }
    timer.start_timer::<PriceChanged>(Duration::from_millis(40))?;

    wait_for(|| batcher.invocations.load(Ordering::SeqCst) >= 1).await;
    // 第二个窗口内没有新消息
    tokio::time::sleep(Duration::from_millis(120)).await;
    timer.dispose().await;

    assert_eq!(batcher.invocations.load(Ordering::SeqCst), 1);
    let batches = batcher.batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(
        batches[0].iter().map(|p| p.seq).collect::<Vec<_>>(),
        vec![0, 1]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_inserts_are_flushed_exactly_once() -> AnyResult<()> {
    let persistor = Arc::new(InMemoryAggregatorPersistor::new());
    let batcher = Arc::new(PriceBatcher::default());
    let mut timer = timer_for(persistor.clone(), batcher.clone());
    timer.start_timer::<PriceChanged>(Duration::from_millis(5))?;

    let writers: Vec<_> = (0..4u32)
        .map(|w| {
            let persistor = persistor.clone();
            tokio::spawn(async move {
                for i in 0..100u32 {
                    persistor
                        .insert_message(&PriceChanged {
                            sku: format!("w{w}"),
                            seq: w * 1000 + i,
                        })
                        .await?;
                    if i % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                Ok::<_, messagebus_core::BusError>(())
            })
        })
        .collect();
    for w in writers {
        w.await??;
    }

    wait_for(|| persistor_is_drained(&batcher)).await;
    timer.dispose().await;
    // 定时器停止后仍可能剩余尾部数据
    let tail = persistor.take_all(PriceChanged::TYPE_NAME).await?;

    let batches = batcher.batches.lock().unwrap();
    let mut seen = HashSet::new();
    let mut total = 0;
    for batch in batches.iter() {
        assert!(!batch.is_empty());
        for p in batch {
            assert!(seen.insert(p.seq), "item {} observed twice", p.seq);
            total += 1;
        }
    }
    assert_eq!(total + tail.len(), 400);
    Ok(())
}

fn persistor_is_drained(batcher: &PriceBatcher) -> bool {
    batcher
        .batches
        .lock()
        .unwrap()
        .iter()
        .map(Vec::len)
        .sum::<usize>()
        >= 400
}

#[tokio::test]
async fn no_ticks_after_dispose() -> AnyResult<()> {
    let persistor = Arc::new(InMemoryAggregatorPersistor::new());
    let batcher = Arc::new(PriceBatcher::default());
    let mut timer = timer_for(persistor.clone(), batcher.clone());

    timer.start_timer::<PriceChanged>(Duration::from_millis(20))?;
    timer.dispose().await;

    persistor
        .insert_message(&PriceChanged {
            sku: "late".into(),
            seq: 9,
        })
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(batcher.invocations.load(Ordering::SeqCst), 0);
    assert_eq!(persistor.count(PriceChanged::TYPE_NAME).await?, 1);
    Ok(())
}
