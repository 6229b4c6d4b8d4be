//! SurrealDB-backed `StateStore`
//!
//! Each record lives at `reconciliation:⟨<storage id>⟩`. Compare-and-swap is
//! a single conditional statement, so it is atomic on the database side:
//! - expected absent  → `CREATE` (fails if the id already exists)
//! - expected present → `UPDATE ... WHERE revision = $expected`

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::error::StorageError;
use crate::handle::{self, StoreConfig};
use crate::migrations::{self, RECORDS_TABLE};
use crate::storage_traits::{
    ensure_key_matches, EntityKey, EntityKind, ReconciliationRecord, StateStore, StorageResult,
};

/// SurrealDB-backed implementation of [`StateStore`].
#[derive(Clone)]
pub struct SurrealStateStore {
    db: Surreal<Any>,
}

impl SurrealStateStore {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect(&StoreConfig::Memory).await
    }

    /// Connect to `config` and make sure the schema exists.
    pub async fn connect(config: &StoreConfig) -> crate::Result<Self> {
        let db = handle::connect(config).await?;
        migrations::init_schema(&db).await?;
        info!(target = %config.describe(), "SurrealStateStore ready");
        Ok(Self { db })
    }

    /// Connect using [`StoreConfig::from_env`].
    pub async fn from_env() -> crate::Result<Self> {
        Self::connect(&StoreConfig::from_env()).await
    }
}

fn backend(err: surrealdb::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

/// A duplicate id or a transaction write conflict means another writer won.
fn lost_race(err: &surrealdb::Error) -> bool {
    let msg = err.to_string();
    msg.contains("already exists") || msg.contains("conflict")
}

#[async_trait]
impl StateStore for SurrealStateStore {
    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &EntityKey) -> StorageResult<Option<ReconciliationRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM type::thing($tb, $id)")
            .bind(("tb", RECORDS_TABLE))
            .bind(("id", key.storage_id()))
            .await
            .map_err(backend)?;

        let rows: Vec<ReconciliationRecord> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next())
    }

    #[instrument(skip(self, record), fields(key = %key))]
    async fn put(
        &self,
        key: &EntityKey,
        mut record: ReconciliationRecord,
    ) -> StorageResult<ReconciliationRecord> {
        ensure_key_matches(key, &record)?;
        let current = self.get(key).await?;
        record.revision = current.map(|r| r.revision + 1).unwrap_or(1);

        debug!(revision = record.revision, "upserting record");
        let mut res = self
            .db
            .query("UPSERT type::thing($tb, $id) CONTENT $row RETURN AFTER")
            .bind(("tb", RECORDS_TABLE))
            .bind(("id", key.storage_id()))
            .bind(("row", record.clone()))
            .await
            .map_err(backend)?;
        let _rows: Vec<ReconciliationRecord> = res.take(0).map_err(backend)?;
        Ok(record)
    }

    #[instrument(skip(self, expected, new), fields(key = %key))]
    async fn compare_and_swap(
        &self,
        key: &EntityKey,
        expected: Option<&ReconciliationRecord>,
        mut new: ReconciliationRecord,
    ) -> StorageResult<bool> {
        ensure_key_matches(key, &new)?;

        match expected {
            None => {
                new.revision = 1;
                let mut res = self
                    .db
                    .query("CREATE type::thing($tb, $id) CONTENT $row RETURN AFTER")
                    .bind(("tb", RECORDS_TABLE))
                    .bind(("id", key.storage_id()))
                    .bind(("row", new))
                    .await
                    .map_err(backend)?;

                match res.take::<Vec<ReconciliationRecord>>(0) {
                    Ok(rows) => Ok(!rows.is_empty()),
                    Err(e) if lost_race(&e) => {
                        debug!("create lost race, record already exists");
                        Ok(false)
                    }
                    Err(e) => Err(backend(e)),
                }
            }
            Some(prev) => {
                new.revision = prev.revision + 1;
                let mut res = self
                    .db
                    .query(
                        "UPDATE type::thing($tb, $id) CONTENT $row \
                         WHERE revision = $expected RETURN AFTER",
                    )
                    .bind(("tb", RECORDS_TABLE))
                    .bind(("id", key.storage_id()))
                    .bind(("row", new))
                    .bind(("expected", prev.revision))
                    .await
                    .map_err(backend)?;

                let rows: Vec<ReconciliationRecord> = match res.take(0) {
                    Ok(rows) => rows,
                    Err(e) if lost_race(&e) => Vec::new(),
                    Err(e) => return Err(backend(e)),
                };
                if rows.is_empty() {
                    debug!(expected = prev.revision, "update lost race, revision moved");
                }
                Ok(!rows.is_empty())
            }
        }
    }

    async fn list(&self, kind: Option<EntityKind>) -> StorageResult<Vec<ReconciliationRecord>> {
        let mut res = match kind {
            Some(kind) => self
                .db
                .query("SELECT * FROM type::table($tb) WHERE key.kind = $kind ORDER BY id")
                .bind(("tb", RECORDS_TABLE))
                .bind(("kind", kind.as_str()))
                .await
                .map_err(backend)?,
            None => self
                .db
                .query("SELECT * FROM type::table($tb) ORDER BY id")
                .bind(("tb", RECORDS_TABLE))
                .await
                .map_err(backend)?,
        };

        res.take(0).map_err(backend)
    }
}
