use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use messagebus_core::{
    error::{BusError, BusResult},
    process_manager::{ProcessManagerEntry, ProcessManagerFinder},
};
use uuid::Uuid;

/// 基于内存的关联存储
/// - 以关联 ID 为键，每个键至多一条记录
/// - 插入/更新通过 DashMap 的分片锁保证“不存在才插入”“存在才更新”的原子性
#[derive(Default)]
pub struct InMemoryProcessManagerFinder {
    entries: DashMap<Uuid, ProcessManagerEntry>,
}

impl InMemoryProcessManagerFinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ProcessManagerFinder for InMemoryProcessManagerFinder {
    async fn insert_entry(&self, entry: ProcessManagerEntry) -> BusResult<()> {
        match self.entries.entry(entry.correlation_id()) {
            Entry::Occupied(occupied) => Err(BusError::DuplicateCorrelationId(*occupied.key())),
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(())
            }
        }
    }

    async fn update_entry(&self, entry: ProcessManagerEntry) -> BusResult<()> {
        let id = entry.correlation_id();
        match self.entries.get_mut(&id) {
            Some(mut stored) => {
                *stored = entry;
                Ok(())
            }
            None => Err(BusError::CorrelationNotFound(id)),
        }
    }

    async fn find_entry(&self, correlation_id: Uuid) -> BusResult<Option<ProcessManagerEntry>> {
        Ok(self.entries.get(&correlation_id).map(|e| e.value().clone()))
    }

    async fn delete_entry(&self, correlation_id: Uuid) -> BusResult<()> {
        self.entries.remove(&correlation_id);
        Ok(())
    }
}
