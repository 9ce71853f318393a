//! Shared persistence layer.
//!
//! Each stateful component that opts into persistence is handed a distinct
//! key prefix so writes never contend. Persistence is always fire-and-forget:
//! failures are reported through [`crate::error::Error::StorageError`] but
//! MUST NOT fail the request path that triggered them.

use async_trait::async_trait;
use crate::error::{Error, Result};

/// A storage backend for component snapshots, keyed by an opaque prefix.
///
/// Payloads are whatever the component chooses to serialize (typically
/// `serde_json` bytes); the backend itself is format-agnostic, storing
/// arbitrary blobs behind a `with_conn` helper rather than hand-rolling a
/// schema per caller.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    async fn save(&self, key_prefix: &str, payload: Vec<u8>) -> Result<()>;
    async fn load(&self, key_prefix: &str) -> Result<Option<Vec<u8>>>;
}

/// Key prefixes used by each persisted component, so storage errors can be
/// attributed in `storage:error{module, operation, error}` events.
pub mod prefixes {
    pub const CACHE: &str = "tokenshield:cache";
    pub const LEDGER: &str = "tokenshield:ledger";
    pub const USER_BUDGET: &str = "tokenshield:user_budget";
    pub const BREAKER: &str = "tokenshield:breaker";
    pub const GUARD: &str = "tokenshield:guard";
}

#[cfg(feature = "persistence")]
pub mod sqlite {
    use super::*;
    use rusqlite::{params, Connection};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// SQLite-backed persistence behind an `Arc<Mutex<Connection>>` +
    /// `with_conn` closure pattern so callers never touch a raw
    /// `rusqlite::Connection`.
    pub struct SqlitePersistence {
        conn: Arc<Mutex<Connection>>,
    }

    impl SqlitePersistence {
        pub async fn open(path: &str) -> Result<Self> {
            Self::open_sync(path)
        }

        /// Synchronous counterpart to [`Self::open`]: `rusqlite::Connection::open`
        /// does no actual async IO, so callers that can't await (e.g.
        /// `TokenShield::new`) can use this directly instead.
        pub fn open_sync(path: &str) -> Result<Self> {
            let conn = Connection::open(path)?;
            Self::init_schema(&conn)?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        pub fn in_memory() -> Result<Self> {
            let conn = Connection::open_in_memory()?;
            Self::init_schema(&conn)?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        fn init_schema(conn: &Connection) -> Result<()> {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS snapshots (
                    key_prefix TEXT PRIMARY KEY,
                    payload BLOB NOT NULL
                )",
                [],
            )?;
            Ok(())
        }

        async fn with_conn<F, T>(&self, f: F) -> Result<T>
        where
            F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
            T: Send + 'static,
        {
            let conn = self.conn.clone();
            let guard = conn.lock().await;
            f(&guard).map_err(Error::from)
        }
    }

    #[async_trait]
    impl PersistenceBackend for SqlitePersistence {
        async fn save(&self, key_prefix: &str, payload: Vec<u8>) -> Result<()> {
            let key = key_prefix.to_string();
            self.with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO snapshots (key_prefix, payload) VALUES (?1, ?2)
                     ON CONFLICT(key_prefix) DO UPDATE SET payload = excluded.payload",
                    params![key, payload],
                )
                .map(|_| ())
            })
            .await
        }

        async fn load(&self, key_prefix: &str) -> Result<Option<Vec<u8>>> {
            let key = key_prefix.to_string();
            self.with_conn(move |conn| {
                conn.query_row(
                    "SELECT payload FROM snapshots WHERE key_prefix = ?1",
                    params![key],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
            })
            .await
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn round_trips_a_blob() {
            let store = SqlitePersistence::in_memory().unwrap();
            store.save(prefixes::CACHE, b"hello".to_vec()).await.unwrap();
            let loaded = store.load(prefixes::CACHE).await.unwrap();
            assert_eq!(loaded, Some(b"hello".to_vec()));
        }

        #[tokio::test]
        async fn missing_key_returns_none() {
            let store = SqlitePersistence::in_memory().unwrap();
            assert_eq!(store.load(prefixes::LEDGER).await.unwrap(), None);
        }

        #[tokio::test]
        async fn file_backed_store_survives_reopen() {
            let dir = tempfile::TempDir::new().unwrap();
            let path = dir.path().join("tokenshield.db");
            let path = path.to_str().unwrap();

            let store = SqlitePersistence::open(path).await.unwrap();
            store
                .save(prefixes::USER_BUDGET, b"snapshot".to_vec())
                .await
                .unwrap();
            drop(store);

            let reopened = SqlitePersistence::open(path).await.unwrap();
            let loaded = reopened.load(prefixes::USER_BUDGET).await.unwrap();
            assert_eq!(loaded, Some(b"snapshot".to_vec()));
        }
    }
}

#[cfg(feature = "persistence")]
pub use sqlite::SqlitePersistence;


