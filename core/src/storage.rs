/// Durable local key-value storage
/// Keys are scoped per viewer: viewer:<viewer_id>:<key> -> JSON bytes
use crate::error::{ChatError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Key-value store backed by sled embedded database
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<sled::Db>,
}

impl LocalStore {
    /// Open (or create) the store in the given data directory
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("portal-chat.db");
        debug!("Opening local store at {:?}", db_path);

        let db = sled::open(&db_path)
            .map_err(|e| ChatError::Storage(format!("Failed to open local store: {}", e)))?;

        info!("Local store initialized at {:?}", db_path);
        Ok(Self { db: Arc::new(db) })
    }

    /// In-memory store that disappears when dropped
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| ChatError::Storage(format!("Failed to open temporary store: {}", e)))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// View of this store restricted to one viewer's keys
    pub fn for_viewer(&self, viewer_id: &str) -> ViewerStorage {
        ViewerStorage {
            store: self.clone(),
            prefix: format!("viewer:{}:", viewer_id),
        }
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.db
            .insert(key.as_bytes(), value)
            .map_err(|e| ChatError::Storage(format!("Failed to store {}: {}", key, e)))?;

        self.db
            .flush()
            .map_err(|e| ChatError::Storage(format!("Failed to flush local store: {}", e)))?;

        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.db.get(key.as_bytes()) {
            Ok(Some(value)) => Ok(Some(value.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(ChatError::Storage(format!("Failed to read {}: {}", key, e))),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db
            .remove(key.as_bytes())
            .map_err(|e| ChatError::Storage(format!("Failed to delete {}: {}", key, e)))?;

        self.db
            .flush()
            .map_err(|e| ChatError::Storage(format!("Failed to flush local store: {}", e)))?;

        Ok(())
    }
}

/// Per-viewer slice of the local store
#[derive(Clone)]
pub struct ViewerStorage {
    store: LocalStore,
    prefix: String,
}

impl ViewerStorage {
    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Read and decode a JSON value
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(&self.key(key))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Encode and write a JSON value, flushed before returning
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.store.put(&self.key(key), bytes)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.store.delete(&self.key(key))
    }
}
