//! Concrete implementations for credvault: keystore-backed key pairs, envelope
//! encryption, capability strategy selection, and a file backing store.
//! Uses X25519 + HKDF-SHA256 key wrapping around AES-256-GCM data keys.

pub mod envelope_cipher;
pub mod file_store;
pub mod key_provider;
pub mod strategy;
