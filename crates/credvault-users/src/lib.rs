//! Encrypted user store: credential records sealed with an [`EnvelopeCipher`]
//! and kept in a [`BackingStore`], one row per identity.

use credvault_core::{
    credential::{CredentialRecord, UserStore},
    storage::{BackingStore, BackingStoreError, RowMetadata, StoredRow},
    CredentialError,
};
use credvault_storage::{envelope_cipher::EnvelopeCipher, key_provider::SecureKeyProvider};
use tracing::{debug, instrument, warn};

/// Credential store with single-current-user semantics.
///
/// Not internally synchronized across calls: concurrent `put`/`remove` on
/// the same identity must be serialized by the caller.
pub struct SecureUserStore<B: BackingStore, P: SecureKeyProvider> {
    backing: B,
    cipher: EnvelopeCipher<P>,
}

impl<B: BackingStore, P: SecureKeyProvider> SecureUserStore<B, P> {
    pub fn new(backing: B, cipher: EnvelopeCipher<P>) -> Self {
        Self { backing, cipher }
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }

    pub fn cipher(&self) -> &EnvelopeCipher<P> {
        &self.cipher
    }

    /// Whether reads and writes can currently reach the key pair.
    pub fn is_unlocked(&self) -> Result<bool, CredentialError> {
        self.cipher.is_unlocked()
    }

    /// Start the platform unlock flow; poll `is_unlocked` for the outcome.
    pub fn request_unlock(&self) -> Result<(), CredentialError> {
        self.cipher.request_unlock()
    }

    /// Decrypt one row. Facility outages propagate; anything wrong with the
    /// row itself is logged and yields `None`.
    fn open_row(
        &self,
        identity: &str,
        row: StoredRow,
    ) -> Result<Option<CredentialRecord>, CredentialError> {
        match self.decode_row(identity, row) {
            Ok(record) => Ok(Some(record)),
            Err(err @ CredentialError::KeyStoreUnavailable { .. }) => Err(err),
            Err(err) if err.is_locked() => {
                warn!(identity, "keystore is locked; credential record unreadable until unlock");
                Ok(None)
            }
            Err(err) => {
                warn!(identity, error = %err, "skipping unreadable credential record");
                Ok(None)
            }
        }
    }

    fn decode_row(&self, identity: &str, row: StoredRow) -> Result<CredentialRecord, CredentialError> {
        let text = String::from_utf8(row.value).map_err(|e| CredentialError::MalformedEnvelope {
            reason: format!("row is not UTF-8: {e}"),
        })?;
        let json = self.cipher.decrypt(&text)?;
        let record = CredentialRecord::from_json(&json)?;
        if record.identity != identity {
            return Err(CredentialError::Serialization {
                reason: format!("row {identity} holds record for {}", record.identity),
            });
        }
        Ok(record)
    }

    /// Fetch one row. A corrupt row is logged and reads as absent; other
    /// backing-store failures propagate.
    fn read_row(&self, identity: &str) -> Result<Option<StoredRow>, CredentialError> {
        match self.backing.read(identity) {
            Ok(row) => Ok(row),
            Err(BackingStoreError::CorruptRow { reason, .. }) => {
                warn!(identity, %reason, "skipping corrupt credential row");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn read_all(&self) -> Result<Vec<CredentialRecord>, CredentialError> {
        let identities = self.backing.list()?;
        if !identities.is_empty() && !self.cipher.is_unlocked()? {
            warn!(
                rows = identities.len(),
                "keystore is locked; stored credential records are unreadable until it is unlocked"
            );
            return Ok(Vec::new());
        }

        let mut records = Vec::with_capacity(identities.len());
        let mut skipped = 0usize;
        for identity in identities {
            match self.backing.read(&identity) {
                Ok(Some(row)) => match self.open_row(&identity, row)? {
                    Some(record) => records.push(record),
                    None => skipped += 1,
                },
                // A row can disappear between list and read.
                Ok(None) => {}
                Err(BackingStoreError::CorruptRow { reason, .. }) => {
                    warn!(identity = %identity, %reason, "skipping corrupt credential row");
                    skipped += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
        if skipped > 0 {
            warn!(skipped, readable = records.len(), "some credential records could not be read");
        }
        Ok(records)
    }
}

impl<B: BackingStore, P: SecureKeyProvider> UserStore for SecureUserStore<B, P> {
    #[instrument(skip_all, fields(identity = %record.identity))]
    fn put(&self, record: &CredentialRecord) -> Result<(), CredentialError> {
        let json = record.to_json()?;
        // Nothing reaches the backing store unless encryption succeeded.
        let envelope = self.cipher.encrypt(&json)?;
        self.backing.write(
            &record.identity,
            envelope.encode().as_bytes(),
            &RowMetadata {
                authority_url: record.authority_url.clone(),
            },
        )?;
        debug!("stored credential record");
        Ok(())
    }

    #[instrument(skip_all, fields(identity = %identity))]
    fn get(&self, identity: &str) -> Result<Option<CredentialRecord>, CredentialError> {
        match self.read_row(identity)? {
            Some(row) => self.open_row(identity, row),
            None => Ok(None),
        }
    }

    #[instrument(skip_all)]
    fn current(&self) -> Result<Option<CredentialRecord>, CredentialError> {
        let mut valid: Vec<CredentialRecord> = self
            .read_all()?
            .into_iter()
            .filter(CredentialRecord::is_valid)
            .collect();
        match valid.len() {
            0 => Ok(None),
            1 => Ok(valid.pop()),
            count => Err(CredentialError::AmbiguousCurrentUser { count }),
        }
    }

    #[instrument(skip_all, fields(identity = %identity))]
    fn remove(&self, identity: &str) -> Result<(), CredentialError> {
        self.backing.delete(identity)?;
        Ok(())
    }

    #[instrument(skip_all)]
    fn all_users(&self) -> Result<Vec<CredentialRecord>, CredentialError> {
        self.read_all()
    }
}
