use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

/// Lifetime recorded on newly generated key pairs.
pub const KEY_VALIDITY_YEARS: i64 = 10;

/// Keyring user name touched to probe and trigger the unlock flow.
const UNLOCK_PROBE_USER: &str = "credvault.unlock-probe";

/// What the secure-key facility can enforce on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacilityCapability {
    /// Stores key pairs only; usage and validity are not enforced.
    Legacy,
    /// Records purpose and validity at generation and enforces them.
    Restricted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPurpose {
    Encrypt,
    Decrypt,
}

/// Parameters for generating a key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGenSpec {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// `None` leaves the key unrestricted.
    pub purposes: Option<Vec<KeyPurpose>>,
}

impl KeyGenSpec {
    /// Validity window only, starting at `now`.
    pub fn validity_only(now: DateTime<Utc>) -> Self {
        Self {
            not_before: now,
            not_after: now + Duration::days(365 * KEY_VALIDITY_YEARS),
            purposes: None,
        }
    }

    /// Validity window plus a usage restriction.
    pub fn restricted(now: DateTime<Utc>, purposes: &[KeyPurpose]) -> Self {
        Self {
            purposes: Some(purposes.to_vec()),
            ..Self::validity_only(now)
        }
    }

    fn validate(&self) -> Result<(), KeyError> {
        if self.not_after <= self.not_before {
            return Err(KeyError::Generation(format!(
                "validity window ends ({}) before it starts ({})",
                self.not_after, self.not_before
            )));
        }
        if self.purposes.as_ref().is_some_and(|p| p.is_empty()) {
            return Err(KeyError::Generation(
                "restricted key needs at least one purpose".to_string(),
            ));
        }
        Ok(())
    }
}

/// Public attributes of a stored key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub alias: String,
    pub created_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub purposes: Option<Vec<KeyPurpose>>,
}

impl KeyInfo {
    pub fn is_within_validity(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }

    pub fn permits(&self, usage: KeyPurpose) -> bool {
        self.purposes
            .as_ref()
            .is_none_or(|purposes| purposes.contains(&usage))
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("secure-key facility unavailable: {0}")]
    Unavailable(String),
    #[error("secure-key facility is locked")]
    Locked,
    #[error("no key pair under alias {alias}")]
    NotFound { alias: String },
    #[error("generation error: {0}")]
    Generation(String),
    #[error("key {alias} is not permitted for {usage:?}")]
    UsageNotPermitted { alias: String, usage: KeyPurpose },
    #[error("key {alias} is outside its validity window")]
    Expired { alias: String },
    #[error("decode error: {0}")]
    Decode(String),
}

/// Alias-addressed asymmetric key storage (OS keyring in production; memory in tests).
/// Private key material never leaves the provider.
pub trait SecureKeyProvider: Send + Sync {
    fn capability(&self) -> FacilityCapability;

    /// Generate a key pair under `alias` unless one already exists.
    fn ensure_key_pair(&self, alias: &str, spec: &KeyGenSpec) -> Result<(), KeyError>;

    fn key_info(&self, alias: &str) -> Result<KeyInfo, KeyError>;

    /// Public half of the pair, checked against the recorded constraints for `usage`.
    fn public_key(&self, alias: &str, usage: KeyPurpose) -> Result<PublicKey, KeyError>;

    /// X25519 agreement between the private key and `peer`, performed inside the provider.
    fn agree(
        &self,
        alias: &str,
        usage: KeyPurpose,
        peer: &PublicKey,
    ) -> Result<SharedSecret, KeyError>;

    /// `Ok(false)` when locked; errors only for facility-level failures.
    fn is_unlocked(&self) -> Result<bool, KeyError>;

    /// Start the platform unlock flow and return immediately. Completion is
    /// observed by polling `is_unlocked`.
    fn request_unlock(&self) -> Result<(), KeyError>;
}

struct KeyPair {
    info: KeyInfo,
    secret: StaticSecret,
}

#[derive(Serialize, Deserialize)]
struct StoredKeyPair {
    info: KeyInfo,
    secret: String,
}

impl KeyPair {
    fn generate(
        alias: &str,
        spec: &KeyGenSpec,
        capability: FacilityCapability,
    ) -> Result<Self, KeyError> {
        spec.validate()?;
        let purposes = match capability {
            FacilityCapability::Restricted => spec.purposes.clone(),
            FacilityCapability::Legacy => {
                if spec.purposes.is_some() {
                    debug!(alias, "legacy facility ignores usage restriction");
                }
                None
            }
        };
        Ok(Self {
            info: KeyInfo {
                alias: alias.to_string(),
                created_at: Utc::now(),
                not_before: spec.not_before,
                not_after: spec.not_after,
                purposes,
            },
            secret: StaticSecret::random_from_rng(OsRng),
        })
    }

    /// Legacy facilities hand the key out regardless of its attributes.
    fn check(&self, usage: KeyPurpose, capability: FacilityCapability) -> Result<(), KeyError> {
        if capability == FacilityCapability::Legacy {
            return Ok(());
        }
        if !self.info.permits(usage) {
            return Err(KeyError::UsageNotPermitted {
                alias: self.info.alias.clone(),
                usage,
            });
        }
        if !self.info.is_within_validity(Utc::now()) {
            return Err(KeyError::Expired {
                alias: self.info.alias.clone(),
            });
        }
        Ok(())
    }

    fn encode(&self) -> Result<Zeroizing<String>, KeyError> {
        let secret = Zeroizing::new(self.secret.to_bytes());
        let stored = StoredKeyPair {
            info: self.info.clone(),
            secret: general_purpose::STANDARD.encode(secret.as_slice()),
        };
        let json = serde_json::to_string(&stored).map_err(|e| KeyError::Decode(e.to_string()))?;
        drop(Zeroizing::new(stored.secret));
        Ok(Zeroizing::new(json))
    }

    fn decode(encoded: &str) -> Result<Self, KeyError> {
        let stored: StoredKeyPair =
            serde_json::from_str(encoded).map_err(|e| KeyError::Decode(e.to_string()))?;
        let bytes = Zeroizing::new(
            general_purpose::STANDARD
                .decode(&stored.secret)
                .map_err(|e| KeyError::Decode(e.to_string()))?,
        );
        drop(Zeroizing::new(stored.secret));

        let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            KeyError::Decode(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self {
            info: stored.info,
            secret: StaticSecret::from(secret),
        })
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("info", &self.info)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// OS keyring-backed provider. Each alias is one keyring entry under `service`.
/// Reports `Restricted` unless overridden with [`KeyringProvider::with_capability`].
pub struct KeyringProvider {
    service: String,
    capability: FacilityCapability,
}

impl KeyringProvider {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            capability: FacilityCapability::Restricted,
        }
    }

    /// Report `capability` instead of the default `Restricted`, e.g. for
    /// keychains that cannot carry attributes.
    pub fn with_capability(mut self, capability: FacilityCapability) -> Self {
        self.capability = capability;
        self
    }

    fn entry(&self, user: &str) -> Result<keyring::Entry, KeyError> {
        keyring::Entry::new(&self.service, user).map_err(map_keyring_err)
    }

    fn load(&self, alias: &str) -> Result<Option<KeyPair>, KeyError> {
        match self.entry(alias)?.get_password() {
            Ok(encoded) => KeyPair::decode(&Zeroizing::new(encoded)).map(Some),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(map_keyring_err(err)),
        }
    }

    fn load_existing(&self, alias: &str) -> Result<KeyPair, KeyError> {
        self.load(alias)?.ok_or_else(|| KeyError::NotFound {
            alias: alias.to_string(),
        })
    }
}

impl SecureKeyProvider for KeyringProvider {
    fn capability(&self) -> FacilityCapability {
        self.capability
    }

    fn ensure_key_pair(&self, alias: &str, spec: &KeyGenSpec) -> Result<(), KeyError> {
        if self.load(alias)?.is_some() {
            return Ok(());
        }

        let pair = KeyPair::generate(alias, spec, self.capability)?;
        self.entry(alias)?
            .set_password(&pair.encode()?)
            .map_err(map_keyring_err)?;
        debug!(alias, service = %self.service, "generated key pair");
        Ok(())
    }

    fn key_info(&self, alias: &str) -> Result<KeyInfo, KeyError> {
        Ok(self.load_existing(alias)?.info)
    }

    fn public_key(&self, alias: &str, usage: KeyPurpose) -> Result<PublicKey, KeyError> {
        let pair = self.load_existing(alias)?;
        pair.check(usage, self.capability)?;
        Ok(PublicKey::from(&pair.secret))
    }

    fn agree(
        &self,
        alias: &str,
        usage: KeyPurpose,
        peer: &PublicKey,
    ) -> Result<SharedSecret, KeyError> {
        let pair = self.load_existing(alias)?;
        pair.check(usage, self.capability)?;
        Ok(pair.secret.diffie_hellman(peer))
    }

    fn is_unlocked(&self) -> Result<bool, KeyError> {
        match self.entry(UNLOCK_PROBE_USER)?.get_password() {
            Ok(_) | Err(keyring::Error::NoEntry) => Ok(true),
            Err(keyring::Error::NoStorageAccess(_)) => Ok(false),
            Err(err) => Err(map_keyring_err(err)),
        }
    }

    fn request_unlock(&self) -> Result<(), KeyError> {
        if self.is_unlocked()? {
            return Ok(());
        }

        // Writing to a locked collection makes the platform keyring prompt the user.
        let service = self.service.clone();
        std::thread::Builder::new()
            .name("credvault-unlock".to_string())
            .spawn(move || {
                let outcome = keyring::Entry::new(&service, UNLOCK_PROBE_USER)
                    .and_then(|entry| entry.set_password("unlocked"));
                match outcome {
                    Ok(()) => debug!(%service, "keyring unlock flow completed"),
                    Err(err) => warn!(%service, "keyring unlock flow did not complete: {err}"),
                }
            })
            .map_err(|e| KeyError::Unavailable(format!("failed to start unlock flow: {e}")))?;
        Ok(())
    }
}

fn map_keyring_err(err: keyring::Error) -> KeyError {
    match err {
        keyring::Error::NoStorageAccess(_) => KeyError::Locked,
        other => KeyError::Unavailable(other.to_string()),
    }
}

/// In-memory provider for tests and ephemeral sessions. Clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryKeyProvider {
    capability: FacilityCapability,
    inner: Arc<Mutex<MemoryFacility>>,
}

#[derive(Debug, Default)]
struct MemoryFacility {
    keys: HashMap<String, KeyPair>,
    locked: bool,
    unlock_pending: bool,
    unlock_requests: usize,
    generated: usize,
}

impl Default for InMemoryKeyProvider {
    fn default() -> Self {
        Self::with_capability(FacilityCapability::Restricted)
    }
}

impl InMemoryKeyProvider {
    pub fn with_capability(capability: FacilityCapability) -> Self {
        Self {
            capability,
            inner: Arc::new(Mutex::new(MemoryFacility::default())),
        }
    }

    /// Same key material, different reported capability (simulates a platform upgrade).
    pub fn upgraded_to(&self, capability: FacilityCapability) -> Self {
        Self {
            capability,
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn set_locked(&self, locked: bool) -> Result<(), KeyError> {
        let mut state = self.state()?;
        state.locked = locked;
        if !locked {
            state.unlock_pending = false;
        }
        Ok(())
    }

    /// Finish a pending unlock flow as if the user authenticated.
    /// Returns whether a flow was pending.
    pub fn complete_unlock(&self) -> Result<bool, KeyError> {
        let mut state = self.state()?;
        if !state.unlock_pending {
            return Ok(false);
        }
        state.unlock_pending = false;
        state.locked = false;
        Ok(true)
    }

    pub fn unlock_requests(&self) -> Result<usize, KeyError> {
        Ok(self.state()?.unlock_requests)
    }

    /// Number of key pairs generated since construction or the last reset.
    pub fn generated_keys(&self) -> Result<usize, KeyError> {
        Ok(self.state()?.generated)
    }

    /// Drop a key pair, as when the platform wipes its keystore.
    pub fn forget_key(&self, alias: &str) -> Result<(), KeyError> {
        self.state()?.keys.remove(alias);
        Ok(())
    }

    /// Re-initialize to a fresh, unlocked facility with no keys.
    pub fn reset(&self) -> Result<(), KeyError> {
        *self.state()? = MemoryFacility::default();
        Ok(())
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryFacility>, KeyError> {
        self.inner
            .lock()
            .map_err(|err| KeyError::Unavailable(format!("lock poisoned: {err}")))
    }

    fn unlocked_state(&self) -> Result<MutexGuard<'_, MemoryFacility>, KeyError> {
        let state = self.state()?;
        if state.locked {
            return Err(KeyError::Locked);
        }
        Ok(state)
    }
}

impl SecureKeyProvider for InMemoryKeyProvider {
    fn capability(&self) -> FacilityCapability {
        self.capability
    }

    fn ensure_key_pair(&self, alias: &str, spec: &KeyGenSpec) -> Result<(), KeyError> {
        let mut state = self.unlocked_state()?;
        if state.keys.contains_key(alias) {
            return Ok(());
        }

        let pair = KeyPair::generate(alias, spec, self.capability)?;
        state.keys.insert(alias.to_string(), pair);
        state.generated += 1;
        Ok(())
    }

    fn key_info(&self, alias: &str) -> Result<KeyInfo, KeyError> {
        let state = self.unlocked_state()?;
        state
            .keys
            .get(alias)
            .map(|pair| pair.info.clone())
            .ok_or_else(|| KeyError::NotFound {
                alias: alias.to_string(),
            })
    }

    fn public_key(&self, alias: &str, usage: KeyPurpose) -> Result<PublicKey, KeyError> {
        let state = self.unlocked_state()?;
        let pair = state.keys.get(alias).ok_or_else(|| KeyError::NotFound {
            alias: alias.to_string(),
        })?;
        pair.check(usage, self.capability)?;
        Ok(PublicKey::from(&pair.secret))
    }

    fn agree(
        &self,
        alias: &str,
        usage: KeyPurpose,
        peer: &PublicKey,
    ) -> Result<SharedSecret, KeyError> {
        let state = self.unlocked_state()?;
        let pair = state.keys.get(alias).ok_or_else(|| KeyError::NotFound {
            alias: alias.to_string(),
        })?;
        pair.check(usage, self.capability)?;
        Ok(pair.secret.diffie_hellman(peer))
    }

    fn is_unlocked(&self) -> Result<bool, KeyError> {
        Ok(!self.state()?.locked)
    }

    fn request_unlock(&self) -> Result<(), KeyError> {
        let mut state = self.state()?;
        if state.locked {
            state.unlock_pending = true;
            state.unlock_requests += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALIAS: &str = "test-alias";

    fn spec() -> KeyGenSpec {
        KeyGenSpec::restricted(Utc::now(), &[KeyPurpose::Encrypt, KeyPurpose::Decrypt])
    }

    #[test]
    fn ensure_key_pair_is_idempotent() {
        let provider = InMemoryKeyProvider::default();
        provider.ensure_key_pair(ALIAS, &spec()).unwrap();
        let first = provider.public_key(ALIAS, KeyPurpose::Encrypt).unwrap();

        provider.ensure_key_pair(ALIAS, &spec()).unwrap();
        let second = provider.public_key(ALIAS, KeyPurpose::Encrypt).unwrap();

        assert_eq!(first.as_bytes(), second.as_bytes());
        assert_eq!(provider.generated_keys().unwrap(), 1);
    }

    #[test]
    fn agreement_matches_peer_side() {
        let provider = InMemoryKeyProvider::default();
        provider.ensure_key_pair(ALIAS, &spec()).unwrap();
        let public = provider.public_key(ALIAS, KeyPurpose::Encrypt).unwrap();

        let peer = StaticSecret::random_from_rng(OsRng);
        let peer_public = PublicKey::from(&peer);
        let ours = provider
            .agree(ALIAS, KeyPurpose::Decrypt, &peer_public)
            .unwrap();
        let theirs = peer.diffie_hellman(&public);
        assert_eq!(ours.as_bytes(), theirs.as_bytes());
    }

    #[test]
    fn restricted_facility_enforces_purpose() {
        let provider = InMemoryKeyProvider::default();
        let encrypt_only = KeyGenSpec::restricted(Utc::now(), &[KeyPurpose::Encrypt]);
        provider.ensure_key_pair(ALIAS, &encrypt_only).unwrap();

        let peer = PublicKey::from(&StaticSecret::random_from_rng(OsRng));
        let Err(err) = provider.agree(ALIAS, KeyPurpose::Decrypt, &peer) else {
            panic!("decrypt not permitted");
        };
        assert!(matches!(err, KeyError::UsageNotPermitted { .. }));
    }

    #[test]
    fn restricted_facility_enforces_validity() {
        let provider = InMemoryKeyProvider::default();
        let now = Utc::now();
        let expired = KeyGenSpec {
            not_before: now - Duration::days(2),
            not_after: now - Duration::days(1),
            purposes: Some(vec![KeyPurpose::Encrypt, KeyPurpose::Decrypt]),
        };
        provider.ensure_key_pair(ALIAS, &expired).unwrap();

        let err = provider
            .public_key(ALIAS, KeyPurpose::Encrypt)
            .expect_err("expired key");
        assert!(matches!(err, KeyError::Expired { .. }));
    }

    #[test]
    fn legacy_facility_drops_restrictions() {
        let provider = InMemoryKeyProvider::with_capability(FacilityCapability::Legacy);
        provider
            .ensure_key_pair(ALIAS, &KeyGenSpec::restricted(Utc::now(), &[KeyPurpose::Encrypt]))
            .unwrap();

        assert_eq!(provider.key_info(ALIAS).unwrap().purposes, None);
        let peer = PublicKey::from(&StaticSecret::random_from_rng(OsRng));
        provider
            .agree(ALIAS, KeyPurpose::Decrypt, &peer)
            .expect("legacy facility does not enforce purpose");
    }

    #[test]
    fn rejects_inverted_validity_window() {
        let provider = InMemoryKeyProvider::default();
        let now = Utc::now();
        let bad = KeyGenSpec {
            not_before: now,
            not_after: now - Duration::seconds(1),
            purposes: None,
        };
        let err = provider.ensure_key_pair(ALIAS, &bad).expect_err("bad window");
        assert!(matches!(err, KeyError::Generation(_)));
    }

    #[test]
    fn locked_facility_refuses_key_operations() {
        let provider = InMemoryKeyProvider::default();
        provider.ensure_key_pair(ALIAS, &spec()).unwrap();
        provider.set_locked(true).unwrap();

        assert!(!provider.is_unlocked().unwrap());
        assert!(matches!(
            provider.public_key(ALIAS, KeyPurpose::Encrypt),
            Err(KeyError::Locked)
        ));
        assert!(matches!(
            provider.ensure_key_pair("other", &spec()),
            Err(KeyError::Locked)
        ));
    }

    #[test]
    fn unlock_is_requested_then_completed_externally() {
        let provider = InMemoryKeyProvider::default();
        provider.request_unlock().unwrap();
        assert_eq!(provider.unlock_requests().unwrap(), 0, "no-op when unlocked");

        provider.set_locked(true).unwrap();
        provider.request_unlock().unwrap();
        assert!(!provider.is_unlocked().unwrap(), "request returns before the flow ends");

        assert!(provider.complete_unlock().unwrap());
        assert!(provider.is_unlocked().unwrap());
        assert_eq!(provider.unlock_requests().unwrap(), 1);
        assert!(!provider.complete_unlock().unwrap());
    }

    #[test]
    fn reset_clears_keys_and_lock_state() {
        let provider = InMemoryKeyProvider::default();
        provider.ensure_key_pair(ALIAS, &spec()).unwrap();
        provider.set_locked(true).unwrap();

        provider.reset().unwrap();
        assert!(provider.is_unlocked().unwrap());
        assert!(matches!(
            provider.key_info(ALIAS),
            Err(KeyError::NotFound { .. })
        ));
        assert_eq!(provider.generated_keys().unwrap(), 0);
    }

    #[test]
    fn stored_pair_round_trips_through_keyring_encoding() {
        let pair = KeyPair::generate(ALIAS, &spec(), FacilityCapability::Restricted).unwrap();
        let encoded = pair.encode().unwrap();
        let decoded = KeyPair::decode(&encoded).unwrap();

        assert_eq!(decoded.info, pair.info);
        assert_eq!(decoded.secret.to_bytes(), pair.secret.to_bytes());
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let json = serde_json::json!({
            "info": KeyInfo {
                alias: ALIAS.into(),
                created_at: Utc::now(),
                not_before: Utc::now(),
                not_after: Utc::now(),
                purposes: None,
            },
            "secret": "abcd",
        })
        .to_string();
        let err = KeyPair::decode(&json).expect_err("should reject wrong length");
        assert!(matches!(err, KeyError::Decode(_)));
    }
}
