use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::capabilities::kv::{DurableStore, StorageKey};
use crate::codec;
use crate::error::{OutboxError, StoreError};
use crate::model::QueuedRequest;

/// Reads and writes the whole queue as one JSON document under one key.
#[derive(Clone)]
pub struct QueueStore {
    backend: Arc<dyn DurableStore>,
    key: StorageKey,
}

impl QueueStore {
    pub fn new(backend: Arc<dyn DurableStore>) -> Self {
        Self::with_key(backend, StorageKey::pending_requests())
    }

    pub fn with_key(backend: Arc<dyn DurableStore>, key: StorageKey) -> Self {
        Self { backend, key }
    }

    pub fn key(&self) -> &StorageKey {
        &self.key
    }

    /// Never fails: an absent, unreadable or unparseable document is an
    /// empty queue. Records that fail validation are logged and skipped, and
    /// the next `save` drops them from storage for good.
    pub async fn load(&self) -> Vec<QueuedRequest> {
        match self.try_load().await {
            Ok(queue) => queue,
            Err(e) => {
                error!(key = %self.key.raw(), error = %e, "Failed to read outbox queue");
                Vec::new()
            }
        }
    }

    /// Like `load`, but surfaces backend read failures so a caller about to
    /// rewrite the document does not overwrite entries it could not see.
    pub async fn try_load(&self) -> Result<Vec<QueuedRequest>, StoreError> {
        let Some(bytes) = self.backend.read(&self.key).await? else {
            return Ok(Vec::new());
        };

        let decoded = match codec::decode_queue(&bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(key = %self.key.raw(), error = %e, "Outbox document is corrupt, starting empty");
                return Ok(Vec::new());
            }
        };

        for (index, reason) in &decoded.skipped {
            warn!(index, error = %reason, "Skipping malformed outbox record");
        }

        debug!(count = decoded.entries.len(), "Loaded outbox queue");
        Ok(decoded.entries)
    }

    pub async fn save(&self, queue: &[QueuedRequest]) -> Result<(), OutboxError> {
        let bytes = codec::encode_queue(queue)?;
        self.backend.write(&self.key, bytes).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), OutboxError> {
        self.backend.remove(&self.key).await?;
        Ok(())
    }
}
