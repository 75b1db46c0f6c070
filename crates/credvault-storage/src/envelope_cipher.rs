use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit},
    Aes256Gcm, Nonce,
};
use chrono::Utc;
use credvault_core::{envelope::EncryptedEnvelope, CipherFailure, CredentialError};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use tracing::{debug, instrument};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::{
    key_provider::{KeyError, KeyPurpose, SecureKeyProvider},
    strategy::CipherStrategy,
};

/// Alias used when the configuration does not name one.
pub const DEFAULT_KEY_ALIAS: &str = "credvault-session-key";

const HKDF_LABEL: &[u8] = b"credvault:envelope-key-wrap";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const PUBLIC_KEY_LEN: usize = 32;

/// `ephemeral_public || nonce || sealed(data key)`.
const WRAPPED_KEY_LEN: usize = PUBLIC_KEY_LEN + NONCE_LEN + KEY_LEN + TAG_LEN;

/// Hybrid encryption: a fresh AES-256-GCM data key per call, wrapped to the
/// provider's X25519 key pair under `alias`.
pub struct EnvelopeCipher<P: SecureKeyProvider> {
    provider: P,
    alias: String,
    strategy: CipherStrategy,
}

impl<P: SecureKeyProvider> EnvelopeCipher<P> {
    /// Probe the provider once and fix the strategy for this cipher's lifetime.
    pub fn new(provider: P, alias: impl Into<String>) -> Self {
        let strategy = CipherStrategy::select(provider.capability());
        let alias = alias.into();
        debug!(%alias, %strategy, "envelope cipher initialized");
        Self {
            provider,
            alias,
            strategy,
        }
    }

    pub fn strategy(&self) -> CipherStrategy {
        self.strategy
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Create the key pair if the facility does not hold one yet.
    pub fn ensure_key_pair(&self) -> Result<(), CredentialError> {
        self.provider
            .ensure_key_pair(&self.alias, &self.strategy.key_spec(Utc::now()))
            .map_err(encryption_err)
    }

    pub fn is_unlocked(&self) -> Result<bool, CredentialError> {
        self.provider.is_unlocked().map_err(encryption_err)
    }

    pub fn request_unlock(&self) -> Result<(), CredentialError> {
        self.provider.request_unlock().map_err(encryption_err)
    }

    #[instrument(skip_all, fields(alias = %self.alias, strategy = %self.strategy))]
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedEnvelope, CredentialError> {
        if !self.is_unlocked()? {
            return Err(CredentialError::EncryptionFailed(CipherFailure::Locked));
        }
        self.ensure_key_pair()?;
        self.strategy
            .preflight(&self.provider, &self.alias)
            .map_err(encryption_err)?;
        let recipient = self
            .provider
            .public_key(&self.alias, KeyPurpose::Encrypt)
            .map_err(encryption_err)?;

        let mut data_key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut data_key[..]);

        let ciphertext = seal(&data_key[..], plaintext.as_bytes())
            .map_err(|reason| CredentialError::EncryptionFailed(CipherFailure::Crypto { reason }))?;
        let wrapped_key = wrap_data_key(&data_key, &recipient)?;

        Ok(EncryptedEnvelope::new(wrapped_key, ciphertext))
    }

    /// Parse and decrypt envelope text.
    pub fn decrypt(&self, envelope: &str) -> Result<String, CredentialError> {
        let envelope = EncryptedEnvelope::parse(envelope)?;
        self.decrypt_envelope(&envelope)
    }

    #[instrument(skip_all, fields(alias = %self.alias, strategy = %self.strategy))]
    pub fn decrypt_envelope(&self, envelope: &EncryptedEnvelope) -> Result<String, CredentialError> {
        check_shape(envelope)?;
        if !self.is_unlocked()? {
            return Err(CredentialError::DecryptionFailed(CipherFailure::Locked));
        }
        self.strategy
            .preflight(&self.provider, &self.alias)
            .map_err(decryption_err)?;

        let data_key = self.unwrap_data_key(envelope.wrapped_key())?;
        let plaintext = open(&data_key[..], envelope.ciphertext())
            .map_err(|reason| CredentialError::DecryptionFailed(CipherFailure::Crypto { reason }))?;

        String::from_utf8(plaintext).map_err(|e| {
            CredentialError::DecryptionFailed(CipherFailure::Crypto {
                reason: format!("plaintext is not UTF-8: {e}"),
            })
        })
    }

    fn unwrap_data_key(&self, wrapped: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>, CredentialError> {
        let (ephemeral, sealed) = wrapped.split_at(PUBLIC_KEY_LEN);
        let mut ephemeral_bytes = [0u8; PUBLIC_KEY_LEN];
        ephemeral_bytes.copy_from_slice(ephemeral);
        let ephemeral = PublicKey::from(ephemeral_bytes);

        let recipient = self
            .provider
            .public_key(&self.alias, KeyPurpose::Decrypt)
            .map_err(decryption_err)?;
        let shared = self
            .provider
            .agree(&self.alias, KeyPurpose::Decrypt, &ephemeral)
            .map_err(decryption_err)?;
        if !shared.was_contributory() {
            return Err(CredentialError::DecryptionFailed(CipherFailure::Crypto {
                reason: "non-contributory ephemeral key".to_string(),
            }));
        }

        let kek = derive_kek(shared.as_bytes(), &ephemeral, &recipient).map_err(|reason| {
            CredentialError::DecryptionFailed(CipherFailure::Crypto { reason })
        })?;
        let data_key = Zeroizing::new(open(&kek[..], sealed).map_err(|_| {
            CredentialError::DecryptionFailed(CipherFailure::Crypto {
                reason: "data key unwrap failed".to_string(),
            })
        })?);

        let mut out = Zeroizing::new([0u8; KEY_LEN]);
        if data_key.len() != KEY_LEN {
            return Err(CredentialError::DecryptionFailed(CipherFailure::Crypto {
                reason: format!("unwrapped key is {} bytes", data_key.len()),
            }));
        }
        out.copy_from_slice(&data_key);
        Ok(out)
    }
}

/// Wrap the data key to `recipient` with an ephemeral X25519 agreement.
fn wrap_data_key(data_key: &[u8; KEY_LEN], recipient: &PublicKey) -> Result<Vec<u8>, CredentialError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);

    let to_err = |reason| CredentialError::EncryptionFailed(CipherFailure::Crypto { reason });
    let kek = derive_kek(shared.as_bytes(), &ephemeral_public, recipient).map_err(to_err)?;
    let sealed = seal(&kek[..], data_key).map_err(to_err)?;

    let mut out = Vec::with_capacity(WRAPPED_KEY_LEN);
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// HKDF-SHA256 over the agreement; info binds both public keys.
fn derive_kek(
    shared: &[u8; 32],
    ephemeral: &PublicKey,
    recipient: &PublicKey,
) -> Result<Zeroizing<[u8; KEY_LEN]>, String> {
    let mut info = Vec::with_capacity(HKDF_LABEL.len() + 2 * PUBLIC_KEY_LEN);
    info.extend_from_slice(HKDF_LABEL);
    info.extend_from_slice(ephemeral.as_bytes());
    info.extend_from_slice(recipient.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(None, shared);
    let mut kek = Zeroizing::new([0u8; KEY_LEN]);
    hkdf.expand(&info, &mut kek[..])
        .map_err(|_| "HKDF expansion failed".to_string())?;
    Ok(kek)
}

/// AES-256-GCM with a random nonce; output is `nonce || ciphertext`.
fn seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, String> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| format!("cipher init failed: {e}"))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| format!("encrypt failed: {e}"))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8], sealed: &[u8]) -> Result<Vec<u8>, String> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(format!("sealed data too short: {} bytes", sealed.len()));
    }
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| format!("cipher init failed: {e}"))?;
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| format!("decrypt failed: {e}"))
}

/// Length checks that tell bad data apart from bad lock state.
fn check_shape(envelope: &EncryptedEnvelope) -> Result<(), CredentialError> {
    if envelope.wrapped_key().len() != WRAPPED_KEY_LEN {
        return Err(CredentialError::MalformedEnvelope {
            reason: format!(
                "wrapped key is {} bytes, expected {WRAPPED_KEY_LEN}",
                envelope.wrapped_key().len()
            ),
        });
    }
    if envelope.ciphertext().len() < NONCE_LEN + TAG_LEN {
        return Err(CredentialError::MalformedEnvelope {
            reason: format!("ciphertext is {} bytes", envelope.ciphertext().len()),
        });
    }
    Ok(())
}

fn key_failure(err: KeyError) -> Result<CipherFailure, CredentialError> {
    match err {
        KeyError::Unavailable(reason) => Err(CredentialError::KeyStoreUnavailable { reason }),
        KeyError::Generation(reason) => Err(CredentialError::KeyGenerationFailed { reason }),
        KeyError::Locked => Ok(CipherFailure::Locked),
        KeyError::NotFound { alias } => Ok(CipherFailure::MissingKey { alias }),
        err @ (KeyError::UsageNotPermitted { .. } | KeyError::Expired { .. }) => {
            Ok(CipherFailure::KeyRejected {
                reason: err.to_string(),
            })
        }
        KeyError::Decode(reason) => Ok(CipherFailure::Crypto { reason }),
    }
}

fn encryption_err(err: KeyError) -> CredentialError {
    key_failure(err).map_or_else(|e| e, CredentialError::EncryptionFailed)
}

fn decryption_err(err: KeyError) -> CredentialError {
    key_failure(err).map_or_else(|e| e, CredentialError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use credvault_core::envelope::DELIMITER;

    use super::*;
    use crate::key_provider::{FacilityCapability, InMemoryKeyProvider};

    fn cipher() -> EnvelopeCipher<InMemoryKeyProvider> {
        EnvelopeCipher::new(InMemoryKeyProvider::default(), "test-key")
    }

    #[test]
    fn round_trip_encrypts_and_decrypts() {
        let cipher = cipher();
        for plaintext in ["", "hello", "{\"identity\":\"JohnDoe\"}", "ünïcødé ✓"] {
            let envelope = cipher.encrypt(plaintext).expect("encrypt");
            let text = envelope.encode();
            assert_eq!(cipher.decrypt(&text).expect("decrypt"), plaintext);
        }
    }

    #[test]
    fn each_encryption_uses_a_fresh_key() {
        let cipher = cipher();
        let first = cipher.encrypt("same secret").expect("encrypt");
        let second = cipher.encrypt("same secret").expect("encrypt");

        assert_ne!(first.wrapped_key(), second.wrapped_key());
        assert_ne!(first.ciphertext(), second.ciphertext());
        assert_eq!(cipher.decrypt_envelope(&first).unwrap(), "same secret");
        assert_eq!(cipher.decrypt_envelope(&second).unwrap(), "same secret");
    }

    #[test]
    fn key_pair_survives_repeated_ensure() {
        let provider = InMemoryKeyProvider::default();
        let cipher = EnvelopeCipher::new(provider.clone(), "test-key");
        let sealed = cipher.encrypt("before").expect("encrypt").encode();

        cipher.ensure_key_pair().expect("ensure again");
        let reopened = EnvelopeCipher::new(provider.clone(), "test-key");
        reopened.ensure_key_pair().expect("ensure from new instance");

        assert_eq!(reopened.decrypt(&sealed).expect("decrypt"), "before");
        assert_eq!(provider.generated_keys().unwrap(), 1);
    }

    #[test]
    fn locked_facility_reports_lock_not_bad_data() {
        let provider = InMemoryKeyProvider::default();
        let cipher = EnvelopeCipher::new(provider.clone(), "test-key");
        let sealed = cipher.encrypt("secret").expect("encrypt").encode();

        provider.set_locked(true).unwrap();
        let err = cipher.encrypt("secret").expect_err("locked");
        assert_eq!(err, CredentialError::EncryptionFailed(CipherFailure::Locked));
        let err = cipher.decrypt(&sealed).expect_err("locked");
        assert_eq!(err, CredentialError::DecryptionFailed(CipherFailure::Locked));

        provider.set_locked(false).unwrap();
        assert_eq!(cipher.decrypt(&sealed).expect("decrypt after unlock"), "secret");
    }

    #[test]
    fn malformed_text_is_not_a_decryption_failure() {
        let cipher = cipher();
        let sealed = cipher.encrypt("secret").expect("encrypt").encode();
        let (wrapped, body) = sealed.split_once(DELIMITER).expect("delimiter");

        let inputs = [
            "no-delimiter-here".to_string(),
            format!("{wrapped}{DELIMITER}{body}{DELIMITER}{body}"),
            format!("{}{DELIMITER}{body}", STANDARD.encode([7u8; 10])),
        ];
        for input in inputs {
            let err = cipher.decrypt(&input).expect_err("malformed");
            assert!(
                matches!(err, CredentialError::MalformedEnvelope { .. }),
                "{input}: {err:?}"
            );
        }
    }

    #[test]
    fn malformed_check_precedes_lock_check() {
        let provider = InMemoryKeyProvider::default();
        let cipher = EnvelopeCipher::new(provider.clone(), "test-key");
        provider.set_locked(true).unwrap();

        let err = cipher.decrypt("garbage").expect_err("malformed");
        assert!(matches!(err, CredentialError::MalformedEnvelope { .. }));
    }

    #[test]
    fn tampered_ciphertext_fails_decryption() {
        let cipher = cipher();
        let envelope = cipher.encrypt("secret").expect("encrypt");
        let mut body = envelope.ciphertext().to_vec();
        let last = body.len() - 1;
        body[last] ^= 0x01;
        let tampered = EncryptedEnvelope::new(envelope.wrapped_key().to_vec(), body);

        let err = cipher.decrypt_envelope(&tampered).expect_err("tampered");
        assert!(matches!(
            err,
            CredentialError::DecryptionFailed(CipherFailure::Crypto { .. })
        ));
    }

    #[test]
    fn missing_key_pair_fails_decryption() {
        let provider = InMemoryKeyProvider::default();
        let cipher = EnvelopeCipher::new(provider.clone(), "test-key");
        let sealed = cipher.encrypt("secret").expect("encrypt").encode();

        provider.forget_key("test-key").unwrap();
        let err = cipher.decrypt(&sealed).expect_err("no key");
        assert!(matches!(
            err,
            CredentialError::DecryptionFailed(CipherFailure::MissingKey { .. })
        ));
    }

    #[test]
    fn other_alias_cannot_unwrap() {
        let provider = InMemoryKeyProvider::default();
        let sealed = EnvelopeCipher::new(provider.clone(), "alice")
            .encrypt("secret")
            .expect("encrypt")
            .encode();
        let other = EnvelopeCipher::new(provider, "bob");
        other.ensure_key_pair().unwrap();

        let err = other.decrypt(&sealed).expect_err("wrong key");
        assert!(matches!(
            err,
            CredentialError::DecryptionFailed(CipherFailure::Crypto { .. })
        ));
    }

    #[test]
    fn envelopes_stay_readable_across_capability_upgrade() {
        let legacy = InMemoryKeyProvider::with_capability(FacilityCapability::Legacy);
        let baseline = EnvelopeCipher::new(legacy.clone(), "test-key");
        assert_eq!(baseline.strategy(), CipherStrategy::Baseline);
        let sealed = baseline.encrypt("written on old platform").unwrap().encode();

        let upgraded = EnvelopeCipher::new(
            legacy.upgraded_to(FacilityCapability::Restricted),
            "test-key",
        );
        assert_eq!(upgraded.strategy(), CipherStrategy::Restricted);
        assert_eq!(upgraded.decrypt(&sealed).unwrap(), "written on old platform");

        let resealed = upgraded.encrypt("written after upgrade").unwrap().encode();
        assert_eq!(baseline.decrypt(&resealed).unwrap(), "written after upgrade");
    }
}
