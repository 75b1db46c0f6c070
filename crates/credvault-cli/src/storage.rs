use std::path::PathBuf;

use crate::config::Config;
use color_eyre::Result;
use credvault_storage::{
    envelope_cipher::{EnvelopeCipher, DEFAULT_KEY_ALIAS},
    file_store::FileBackingStore,
    key_provider::KeyringProvider,
};
use credvault_users::SecureUserStore;
use dirs::data_dir;
use tracing::debug;

/// Keyring service name used when the config does not override it.
pub const DEFAULT_SERVICE: &str = "credvault";

pub type UserVault = SecureUserStore<FileBackingStore, KeyringProvider>;

/// Resolve the default data directory for credvault.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("credvault"))
}

/// Directory holding encrypted rows, honoring the config override.
pub fn data_dir_for(config: &Config) -> Result<PathBuf> {
    match &config.data_dir {
        Some(root) => Ok(root.clone()),
        None => default_data_dir(),
    }
}

/// OS keyring provider with the configured service name and capability override.
pub fn key_provider(config: &Config) -> KeyringProvider {
    let keystore = config.keystore.as_ref();
    let service = keystore
        .and_then(|k| k.service.clone())
        .unwrap_or_else(|| DEFAULT_SERVICE.to_string());
    let provider = KeyringProvider::new(service);
    match keystore.and_then(|k| k.capability) {
        Some(capability) => provider.with_capability(capability),
        None => provider,
    }
}

pub fn key_alias(config: &Config) -> String {
    config
        .keystore
        .as_ref()
        .and_then(|k| k.alias.clone())
        .unwrap_or_else(|| DEFAULT_KEY_ALIAS.to_string())
}

/// Build the production user store: file rows sealed with a keyring-held key.
pub fn store_from_config(config: &Config) -> Result<UserVault> {
    let root = data_dir_for(config)?;
    let alias = key_alias(config);
    debug!(?root, %alias, "initializing user store");
    Ok(SecureUserStore::new(
        FileBackingStore::new(root),
        EnvelopeCipher::new(key_provider(config), alias),
    ))
}

/// Helper for tests to construct a store rooted at a temp dir with an in-memory key.
#[cfg(test)]
pub fn test_store(
    root: impl Into<PathBuf>,
) -> SecureUserStore<FileBackingStore, credvault_storage::key_provider::InMemoryKeyProvider> {
    use credvault_storage::key_provider::InMemoryKeyProvider;

    SecureUserStore::new(
        FileBackingStore::new(root),
        EnvelopeCipher::new(InMemoryKeyProvider::default(), DEFAULT_KEY_ALIAS),
    )
}
