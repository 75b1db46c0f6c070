//! Choice of encryption variant by facility capability.
//!
//! Both variants write byte-identical envelopes, so a record sealed under one
//! stays readable under the other as long as the key alias survives.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::key_provider::{FacilityCapability, KeyError, KeyGenSpec, KeyPurpose, SecureKeyProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherStrategy {
    /// Older facilities: validity-only keys, constraints checked in software.
    Baseline,
    /// Newer facilities: purpose-restricted keys, constraints enforced by the facility.
    Restricted,
}

impl CipherStrategy {
    /// Pure function of the reported capability.
    pub fn select(capability: FacilityCapability) -> Self {
        match capability {
            FacilityCapability::Legacy => CipherStrategy::Baseline,
            FacilityCapability::Restricted => CipherStrategy::Restricted,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CipherStrategy::Baseline => "baseline",
            CipherStrategy::Restricted => "restricted",
        }
    }

    /// Generation parameters for a key pair created under this variant.
    pub fn key_spec(self, now: DateTime<Utc>) -> KeyGenSpec {
        match self {
            CipherStrategy::Baseline => KeyGenSpec::validity_only(now),
            CipherStrategy::Restricted => {
                KeyGenSpec::restricted(now, &[KeyPurpose::Encrypt, KeyPurpose::Decrypt])
            }
        }
    }

    /// Checks the facility will not make on its own.
    pub fn preflight<P>(self, provider: &P, alias: &str) -> Result<(), KeyError>
    where
        P: SecureKeyProvider + ?Sized,
    {
        match self {
            CipherStrategy::Restricted => Ok(()),
            CipherStrategy::Baseline => {
                let info = provider.key_info(alias)?;
                if info.is_within_validity(Utc::now()) {
                    Ok(())
                } else {
                    Err(KeyError::Expired {
                        alias: alias.to_string(),
                    })
                }
            }
        }
    }
}

impl fmt::Display for CipherStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::key_provider::InMemoryKeyProvider;

    #[test]
    fn selection_follows_capability() {
        assert_eq!(
            CipherStrategy::select(FacilityCapability::Legacy),
            CipherStrategy::Baseline
        );
        assert_eq!(
            CipherStrategy::select(FacilityCapability::Restricted),
            CipherStrategy::Restricted
        );
    }

    #[test]
    fn restricted_spec_limits_purpose() {
        let now = Utc::now();
        let spec = CipherStrategy::Restricted.key_spec(now);
        assert_eq!(
            spec.purposes,
            Some(vec![KeyPurpose::Encrypt, KeyPurpose::Decrypt])
        );
        assert!(spec.not_after > now + Duration::days(365 * 9));

        assert_eq!(CipherStrategy::Baseline.key_spec(now).purposes, None);
    }

    #[test]
    fn baseline_preflight_rejects_expired_key() {
        let provider = InMemoryKeyProvider::with_capability(FacilityCapability::Legacy);
        let now = Utc::now();
        let stale = KeyGenSpec {
            not_before: now - Duration::days(30),
            not_after: now - Duration::days(1),
            purposes: None,
        };
        provider.ensure_key_pair("old", &stale).unwrap();

        let err = CipherStrategy::Baseline
            .preflight(&provider, "old")
            .expect_err("expired");
        assert!(matches!(err, KeyError::Expired { .. }));
        CipherStrategy::Restricted
            .preflight(&provider, "old")
            .expect("restricted variant defers to the facility");
    }
}
