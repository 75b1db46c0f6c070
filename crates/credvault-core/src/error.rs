use thiserror::Error;

use crate::storage::BackingStoreError;

/// Why an encrypt or decrypt call could not complete.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CipherFailure {
    /// The secure-key facility refused key operations until the user unlocks it.
    #[error("secure-key facility is locked")]
    Locked,
    /// No key pair exists under the configured alias.
    #[error("no key pair under alias {alias}")]
    MissingKey { alias: String },
    /// The key exists but its recorded constraints forbid this use.
    #[error("key rejected: {reason}")]
    KeyRejected { reason: String },
    /// Key unwrap or authenticated decryption failed.
    #[error("{reason}")]
    Crypto { reason: String },
}

/// Errors surfaced by the credential subsystem.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    /// The secure-key facility could not be reached at all.
    #[error("key store unavailable: {reason}")]
    KeyStoreUnavailable { reason: String },
    /// The facility rejected key generation parameters.
    #[error("key generation failed: {reason}")]
    KeyGenerationFailed { reason: String },
    #[error("encryption failed: {0}")]
    EncryptionFailed(CipherFailure),
    #[error("decryption failed: {0}")]
    DecryptionFailed(CipherFailure),
    /// Envelope text does not match `wrapped_key ] ciphertext`.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },
    /// More than one stored record is currently valid.
    #[error("current user is ambiguous: {count} valid, logged-in users exist")]
    AmbiguousCurrentUser { count: usize },
    #[error(transparent)]
    Storage(#[from] BackingStoreError),
    #[error("serialization failed: {reason}")]
    Serialization { reason: String },
}

impl CredentialError {
    /// True when the failure clears after the user unlocks the facility.
    pub fn is_locked(&self) -> bool {
        matches!(
            self,
            CredentialError::EncryptionFailed(CipherFailure::Locked)
                | CredentialError::DecryptionFailed(CipherFailure::Locked)
        )
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        CredentialError::MalformedEnvelope {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for CredentialError {
    fn from(err: serde_json::Error) -> Self {
        CredentialError::Serialization {
            reason: err.to_string(),
        }
    }
}
