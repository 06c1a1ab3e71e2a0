//! Durable key-value storage the outbox persists its queue document into.
//!
//! Three backends are provided: an in-memory map for tests and ephemeral
//! sessions, a directory of files written atomically, and SQLite for
//! native builds.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_PREFIX_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Outbox,
    Custom(String),
}

impl KeyNamespace {
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Outbox => "outbox",
            KeyNamespace::Custom(s) => s.as_str(),
        }
    }

    pub fn custom(prefix: impl Into<String>) -> Result<Self, StoreError> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(StoreError::InvalidKey {
                key: prefix,
                reason: "custom namespace cannot be empty".to_string(),
            });
        }
        if prefix.len() > MAX_PREFIX_LENGTH {
            return Err(StoreError::InvalidKey {
                key: prefix,
                reason: format!(
                    "custom namespace exceeds maximum length of {} bytes",
                    MAX_PREFIX_LENGTH
                ),
            });
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(StoreError::InvalidKey {
                key: prefix,
                reason: "custom namespace contains invalid characters".to_string(),
            });
        }
        Ok(KeyNamespace::Custom(prefix))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageKey {
    namespace: KeyNamespace,
    key: String,
}

impl StorageKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, StoreError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    /// Key under which the outbox keeps its queue (`outbox:pending_requests`).
    pub fn pending_requests() -> Self {
        Self {
            namespace: KeyNamespace::Outbox,
            key: "pending_requests".to_string(),
        }
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// File-system safe form of `raw()`.
    fn file_name(&self) -> String {
        let mut name: String = self
            .raw()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        name.push_str(".json");
        name
    }

    fn validate_key(key: &str) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(StoreError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
            });
        }

        if key.trim().is_empty() {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be only whitespace".to_string(),
            });
        }

        if key.contains("..") {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }

        if key.starts_with('/') || key.starts_with('\\') {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot start with path separator".to_string(),
            });
        }

        if key.chars().any(char::is_control) {
            return Err(StoreError::InvalidKey {
                key: key.replace('\0', "\\0"),
                reason: "key contains control characters".to_string(),
            });
        }

        Ok(())
    }
}

fn check_size(value: &[u8]) -> Result<(), StoreError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(StoreError::TooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// Whole-value reads and writes. A write either replaces the value
/// completely or leaves the previous one in place.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn read(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StoreError>;
    async fn write(&self, key: &StorageKey, value: Vec<u8>) -> Result<(), StoreError>;
    async fn remove(&self, key: &StorageKey) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn read(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().await.get(&key.raw()).cloned())
    }

    async fn write(&self, key: &StorageKey, value: Vec<u8>) -> Result<(), StoreError> {
        check_size(&value)?;
        self.entries.write().await.insert(key.raw(), value);
        Ok(())
    }

    async fn remove(&self, key: &StorageKey) -> Result<(), StoreError> {
        self.entries.write().await.remove(&key.raw());
        Ok(())
    }
}

/// One file per key inside `dir`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, key: &StorageKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    fn write_atomic(path: &Path, value: &[u8]) -> Result<(), StoreError> {
        let tmp_path = path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(value)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, path)?;

        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn read(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key);
        tokio::task::spawn_blocking(move || match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        })
        .await?
    }

    async fn write(&self, key: &StorageKey, value: Vec<u8>) -> Result<(), StoreError> {
        check_size(&value)?;
        let path = self.path_for(key);
        debug!(path = %path.display(), bytes = value.len(), "Writing store file");
        tokio::task::spawn_blocking(move || Self::write_atomic(&path, &value)).await?
    }

    async fn remove(&self, key: &StorageKey) -> Result<(), StoreError> {
        let path = self.path_for(key);
        tokio::task::spawn_blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        })
        .await?
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteStore;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use super::*;
    use rusqlite::{params, Connection, OptionalExtension};
    use std::sync::{Arc, Mutex};

    /// Key-value table in a SQLite database.
    #[derive(Clone)]
    pub struct SqliteStore {
        conn: Arc<Mutex<Connection>>,
    }

    impl SqliteStore {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
            let conn = Connection::open(path)?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> Result<Self, StoreError> {
            Self::init(Connection::open_in_memory()?)
        }

        fn init(conn: Connection) -> Result<Self, StoreError> {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS kv_store (
                    key TEXT PRIMARY KEY,
                    value BLOB NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                "#,
            )?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
        where
            T: Send + 'static,
            F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        {
            let conn = Arc::clone(&self.conn);
            tokio::task::spawn_blocking(move || {
                let guard = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
                f(&guard)
            })
            .await?
        }
    }

    #[async_trait]
    impl DurableStore for SqliteStore {
        async fn read(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StoreError> {
            let raw = key.raw();
            self.with_conn(move |conn| {
                let value = conn
                    .query_row(
                        "SELECT value FROM kv_store WHERE key = ?1",
                        params![raw],
                        |row| row.get::<_, Vec<u8>>(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await
        }

        async fn write(&self, key: &StorageKey, value: Vec<u8>) -> Result<(), StoreError> {
            check_size(&value)?;
            let raw = key.raw();
            let now = crate::model::UnixTimeMs::now().as_millis() as i64;
            self.with_conn(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO kv_store (key, value, updated_at)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at
                    "#,
                    params![raw, value, now],
                )?;
                Ok(())
            })
            .await
        }

        async fn remove(&self, key: &StorageKey) -> Result<(), StoreError> {
            let raw = key.raw();
            self.with_conn(move |conn| {
                conn.execute("DELETE FROM kv_store WHERE key = ?1", params![raw])?;
                Ok(())
            })
            .await
        }
    }
}
