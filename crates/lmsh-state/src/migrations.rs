//! SurrealDB schema initialization for the reconciliation store
//!
//! Safe to call on every connection: every definition uses `IF NOT EXISTS`.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StateError;
use crate::Result;

/// Name of the table holding `ReconciliationRecord`s
pub const RECORDS_TABLE: &str = "reconciliation";

/// Initialize all LMSH tables
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing LMSH state schema");
    init_records_table(db).await?;
    info!("LMSH state schema ready");
    Ok(())
}

/// Initialize the `reconciliation` table
///
/// Schema:
/// ```text
/// TABLE reconciliation {
///   id:               reconciliation:⟨<storage id>⟩
///   key:              OBJECT  { kind, org, course_code, assignment?, student? }
///   remote_id:        STRING  (indexed)
///   remote_url:       STRING?
///   config_digest:    STRING  (64 hex)
///   applied:          OBJECT
///   revision_marker:  STRING?
///   last_synced_at:   STRING  (RFC 3339)
///   last_error:       STRING?
///   revision:         INT     (optimistic concurrency counter)
/// }
/// ```
///
/// Records are never deleted by LMSH; delete permission is withheld.
async fn init_records_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing reconciliation table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS reconciliation
            SCHEMALESS
            PERMISSIONS
                FOR select FULL
                FOR create FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_reconciliation_kind
            ON TABLE reconciliation COLUMNS key.kind;

        DEFINE INDEX IF NOT EXISTS idx_reconciliation_remote
            ON TABLE reconciliation COLUMNS remote_id;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?
        .check()
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;

    debug!("reconciliation table initialized");
    Ok(())
}
