use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by backing store implementations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackingStoreError {
    /// The identity cannot be used as a row key.
    #[error("invalid identity: {reason}")]
    InvalidIdentity { reason: String },
    /// The row for one identity exists but cannot be decoded. Other rows are unaffected.
    #[error("corrupt row for {identity}: {reason}")]
    CorruptRow { identity: String, reason: String },
    /// Underlying storage failure.
    #[error("storage failure: {reason}")]
    Storage { reason: String },
}

/// Plaintext, non-secret attributes kept beside the envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowMetadata {
    pub authority_url: String,
}

/// One row as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    /// Opaque envelope bytes.
    pub value: Vec<u8>,
    pub metadata: RowMetadata,
}

/// Persisted identity -> encrypted row mapping. Treated as authoritative for
/// existence; callers never cache.
pub trait BackingStore: Send + Sync {
    /// Read the row for an identity, `None` when absent.
    fn read(&self, identity: &str) -> Result<Option<StoredRow>, BackingStoreError>;

    /// Persist a row, replacing any existing row for the identity.
    fn write(
        &self,
        identity: &str,
        value: &[u8],
        metadata: &RowMetadata,
    ) -> Result<(), BackingStoreError>;

    /// Remove a row (idempotent).
    fn delete(&self, identity: &str) -> Result<(), BackingStoreError>;

    /// All identities with a row. Order is unspecified.
    fn list(&self) -> Result<Vec<String>, BackingStoreError>;
}

/// Process-local backing store for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackingStore {
    inner: Arc<Mutex<HashMap<String, StoredRow>>>,
}

impl InMemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every row. Clones share state, so this resets all of them.
    pub fn clear(&self) -> Result<(), BackingStoreError> {
        self.rows()?.clear();
        Ok(())
    }

    fn rows(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, StoredRow>>, BackingStoreError> {
        self.inner.lock().map_err(|err| BackingStoreError::Storage {
            reason: format!("lock poisoned: {err}"),
        })
    }
}

impl BackingStore for InMemoryBackingStore {
    fn read(&self, identity: &str) -> Result<Option<StoredRow>, BackingStoreError> {
        Ok(self.rows()?.get(identity).cloned())
    }

    fn write(
        &self,
        identity: &str,
        value: &[u8],
        metadata: &RowMetadata,
    ) -> Result<(), BackingStoreError> {
        if identity.is_empty() {
            return Err(BackingStoreError::InvalidIdentity {
                reason: "identity is empty".to_string(),
            });
        }
        self.rows()?.insert(
            identity.to_string(),
            StoredRow {
                value: value.to_vec(),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    fn delete(&self, identity: &str) -> Result<(), BackingStoreError> {
        self.rows()?.remove(identity);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, BackingStoreError> {
        Ok(self.rows()?.keys().cloned().collect())
    }
}
