//! Core contracts for credvault: credential records, the backing-store
//! interface, the envelope wire format, and the shared error type.
//! Concrete crypto and keystore integrations live in `credvault-storage`.

pub mod credential;
pub mod envelope;
pub mod error;
pub mod storage;

pub use error::{CipherFailure, CredentialError};
