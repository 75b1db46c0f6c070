//! Text form of an encrypted credential:
//! `base64(wrapped_symmetric_key) ] base64(ciphertext)`.
//!
//! Both segments use the standard base64 alphabet, which never contains the
//! delimiter. Neither segment is useful without the other.

use std::{fmt, str::FromStr};

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::CredentialError;

/// Separates the wrapped key from the ciphertext.
pub const DELIMITER: char = ']';

/// Wrapped symmetric key plus the data it encrypted.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    wrapped_key: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl EncryptedEnvelope {
    pub fn new(wrapped_key: Vec<u8>, ciphertext: Vec<u8>) -> Self {
        Self {
            wrapped_key,
            ciphertext,
        }
    }

    pub fn wrapped_key(&self) -> &[u8] {
        &self.wrapped_key
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Split and decode envelope text. Any structural problem is reported as
    /// `MalformedEnvelope`, never as a decryption failure.
    pub fn parse(text: &str) -> Result<Self, CredentialError> {
        let segments: Vec<&str> = text.trim().split(DELIMITER).collect();
        if segments.len() != 2 {
            return Err(CredentialError::malformed(format!(
                "expected 2 segments, found {}",
                segments.len()
            )));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(CredentialError::malformed("empty segment"));
        }

        let wrapped_key = STANDARD
            .decode(segments[0])
            .map_err(|e| CredentialError::malformed(format!("wrapped key decode failed: {e}")))?;
        let ciphertext = STANDARD
            .decode(segments[1])
            .map_err(|e| CredentialError::malformed(format!("ciphertext decode failed: {e}")))?;

        Ok(Self::new(wrapped_key, ciphertext))
    }

    pub fn encode(&self) -> String {
        format!(
            "{}{DELIMITER}{}",
            STANDARD.encode(&self.wrapped_key),
            STANDARD.encode(&self.ciphertext)
        )
    }
}

impl FromStr for EncryptedEnvelope {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for EncryptedEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

// Never dump key or ciphertext bytes into logs.
impl fmt::Debug for EncryptedEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedEnvelope")
            .field("wrapped_key_len", &self.wrapped_key.len())
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}
