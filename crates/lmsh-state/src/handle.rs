//! SurrealDB connection targets
//!
//! Resolves where the reconciliation state lives and opens a connection:
//! - `Memory`: `mem://`, lost on exit (tests, dry runs)
//! - `Local`: SurrealKV files on disk (default, `.lmsh/db`)
//! - `Url`: any SurrealDB URL (`ws://`, `wss://`, `surrealkv://`, ...)
//! - `Cloud`: authenticated WebSocket connection

use std::path::PathBuf;

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{info, instrument};

use crate::error::StateError;
use crate::Result;

const DEFAULT_NAMESPACE: &str = "lmsh";
const DEFAULT_DATABASE: &str = "main";
const DEFAULT_LOCAL_PATH: &str = ".lmsh/db";

/// Credentials for an authenticated SurrealDB endpoint
#[derive(Debug, Clone)]
pub struct CloudCredentials {
    /// WebSocket endpoint URL (e.g., "wss://xxx.aws-use1.surrealdb.cloud")
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

/// Where the state store lives
#[derive(Debug, Clone)]
pub enum StoreConfig {
    Memory,
    Local {
        path: PathBuf,
    },
    Url {
        url: String,
        namespace: String,
        database: String,
    },
    Cloud {
        credentials: CloudCredentials,
        namespace: String,
        database: String,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Local {
            path: PathBuf::from(DEFAULT_LOCAL_PATH),
        }
    }
}

impl StoreConfig {
    /// Resolve the store target from environment variables
    ///
    /// Precedence:
    /// 1. SURREALDB_ENDPOINT + SURREALDB_USERNAME + SURREALDB_PASSWORD → cloud
    ///    (SURREALDB_NAMESPACE, SURREALDB_DATABASE, SURREALDB_ROOT optional)
    /// 2. LMSH_STORE_URL → that URL (`mem://` selects the in-memory engine)
    /// 3. LMSH_STORE_PATH or `.lmsh/db` → local SurrealKV
    pub fn from_env() -> Self {
        let namespace =
            std::env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let database =
            std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| DEFAULT_DATABASE.to_string());

        if let (Ok(endpoint), Ok(username), Ok(password)) = (
            std::env::var("SURREALDB_ENDPOINT"),
            std::env::var("SURREALDB_USERNAME"),
            std::env::var("SURREALDB_PASSWORD"),
        ) {
            let is_root = std::env::var("SURREALDB_ROOT")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false);
            return StoreConfig::Cloud {
                credentials: CloudCredentials {
                    endpoint,
                    username,
                    password,
                    is_root,
                },
                namespace,
                database,
            };
        }

        if let Ok(url) = std::env::var("LMSH_STORE_URL") {
            if url == "mem://" {
                return StoreConfig::Memory;
            }
            return StoreConfig::Url {
                url,
                namespace,
                database,
            };
        }

        let path = std::env::var("LMSH_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOCAL_PATH));
        StoreConfig::Local { path }
    }

    /// Human-readable description without secrets
    pub fn describe(&self) -> String {
        match self {
            StoreConfig::Memory => "mem://".to_string(),
            StoreConfig::Local { path } => format!("surrealkv://{}", path.display()),
            StoreConfig::Url { url, .. } => url.clone(),
            StoreConfig::Cloud { credentials, .. } => credentials.endpoint.clone(),
        }
    }
}

/// Open a connection for `config` and select namespace/database.
#[instrument(skip(config), fields(target = %config.describe()))]
pub(crate) async fn connect(config: &StoreConfig) -> Result<Surreal<Any>> {
    let (db, namespace, database) = match config {
        StoreConfig::Memory => (
            open("mem://").await?,
            DEFAULT_NAMESPACE,
            DEFAULT_DATABASE,
        ),
        StoreConfig::Local { path } => {
            std::fs::create_dir_all(path).map_err(|e| {
                StateError::Connection(format!(
                    "Failed to create database directory {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let url = format!("surrealkv://{}", path.display());
            (open(&url).await?, DEFAULT_NAMESPACE, DEFAULT_DATABASE)
        }
        StoreConfig::Url {
            url,
            namespace,
            database,
        } => (open(url).await?, namespace.as_str(), database.as_str()),
        StoreConfig::Cloud {
            credentials,
            namespace,
            database,
        } => {
            let db = open(&credentials.endpoint).await?;
            if credentials.is_root {
                db.signin(Root {
                    username: &credentials.username,
                    password: &credentials.password,
                })
                .await
                .map_err(|e| StateError::Connection(format!("Root authentication failed: {e}")))?;
            } else {
                db.signin(Database {
                    namespace,
                    database,
                    username: &credentials.username,
                    password: &credentials.password,
                })
                .await
                .map_err(|e| {
                    StateError::Connection(format!("Database authentication failed: {e}"))
                })?;
            }
            (db, namespace.as_str(), database.as_str())
        }
    };

    db.use_ns(namespace).use_db(database).await.map_err(|e| {
        StateError::Connection(format!("Failed to select namespace/database: {e}"))
    })?;

    info!("State store connected");
    Ok(db)
}

async fn open(url: &str) -> Result<Surreal<Any>> {
    surrealdb::engine::any::connect(url)
        .await
        .map_err(|e| StateError::Connection(format!("Failed to connect to {url}: {e}")))
}
