use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::CredentialError;

/// Access level granted by a token.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Download,
    Upload,
    Manage,
}

/// Bearer token issued by the authority server.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionToken {
    pub value: String,
    pub identity: String,
    /// Resource path the token is scoped to; `None` for user tokens.
    #[serde(default)]
    pub path: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

impl SessionToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("value", &"[REDACTED]")
            .field("identity", &self.identity)
            .field("path", &self.path)
            .field("expires_at", &self.expires_at)
            .field("permissions", &self.permissions)
            .finish()
    }
}

/// Access granted to one remote resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RealmAccess {
    pub realm_url: String,
    pub local_path: String,
    pub access_token: SessionToken,
    #[serde(default)]
    pub is_admin: bool,
}

/// Session state protected at rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionPayload {
    /// Cleared on logout.
    pub user_token: Option<SessionToken>,
    #[serde(default)]
    pub realms: Vec<RealmAccess>,
}

/// A stored user session, keyed by `identity`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialRecord {
    pub identity: String,
    pub authority_url: String,
    pub session: SessionPayload,
}

impl CredentialRecord {
    pub fn new(
        identity: impl Into<String>,
        authority_url: impl Into<String>,
        user_token: SessionToken,
    ) -> Self {
        Self {
            identity: identity.into(),
            authority_url: authority_url.into(),
            session: SessionPayload {
                user_token: Some(user_token),
                realms: Vec::new(),
            },
        }
    }

    pub fn with_realm(mut self, access: RealmAccess) -> Self {
        self.session.realms.push(access);
        self
    }

    /// Logged in with an unexpired user token.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.session
            .user_token
            .as_ref()
            .is_some_and(|token| !token.is_expired_at(now))
    }

    /// Drop every token; the record stays but is no longer valid.
    pub fn logout(&mut self) {
        self.session.user_token = None;
        self.session.realms.clear();
    }

    pub fn to_json(&self) -> Result<String, CredentialError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CredentialError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Keyed store of credential records with single-current-user semantics.
pub trait UserStore: Send + Sync {
    /// Persist a record, replacing any record with the same identity.
    fn put(&self, record: &CredentialRecord) -> Result<(), CredentialError>;

    /// Fetch one record; `None` when absent or unreadable.
    fn get(&self, identity: &str) -> Result<Option<CredentialRecord>, CredentialError>;

    /// The single valid record, if any. More than one is an error.
    fn current(&self) -> Result<Option<CredentialRecord>, CredentialError>;

    /// Remove a record (idempotent).
    fn remove(&self, identity: &str) -> Result<(), CredentialError>;

    /// Every readable record regardless of validity, in no particular order.
    fn all_users(&self) -> Result<Vec<CredentialRecord>, CredentialError>;
}
