//! In-memory fake for the `StateStore` trait (testing only)
//!
//! `MemoryStateStore` satisfies the trait contract without any external
//! dependencies and counts writes so tests can assert that an idempotent run
//! left the store untouched.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

/// In-memory state store backed by a `BTreeMap<storage_id, record>`.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<BTreeMap<String, ReconciliationRecord>>,
    writes: AtomicU64,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes since creation.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, BTreeMap<String, ReconciliationRecord>>> {
        self.records
            .lock()
            .map_err(|_| StorageError::Backend("memory store mutex poisoned".to_string()))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &EntityKey) -> StorageResult<Option<ReconciliationRecord>> {
        let records = self.lock()?;
        Ok(records.get(&key.storage_id()).cloned())
    }

    async fn put(
        &self,
        key: &EntityKey,
        mut record: ReconciliationRecord,
    ) -> StorageResult<ReconciliationRecord> {
        ensure_key_matches(key, &record)?;
        let mut records = self.lock()?;
        let id = key.storage_id();
        record.revision = records.get(&id).map(|r| r.revision + 1).unwrap_or(1);
        records.insert(id, record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    async fn compare_and_swap(
        &self,
        key: &EntityKey,
        expected: Option<&ReconciliationRecord>,
        mut new: ReconciliationRecord,
    ) -> StorageResult<bool> {
        ensure_key_matches(key, &new)?;
        let mut records = self.lock()?;
        let id = key.storage_id();
        let current = records.get(&id).map(|r| r.revision);
        if current != expected.map(|r| r.revision) {
            return Ok(false);
        }
        new.revision = current.map(|r| r + 1).unwrap_or(1);
        records.insert(id, new);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn list(&self, kind: Option<EntityKind>) -> StorageResult<Vec<ReconciliationRecord>> {
        let records = self.lock()?;
        Ok(records
            .values()
            .filter(|r| kind.map(|k| r.key.kind() == k).unwrap_or(true))
            .cloned()
            .collect())
    }
}
