//! Backing key-value store contract for encrypted credential rows.

mod backing_store;

pub use backing_store::{
    BackingStore, BackingStoreError, InMemoryBackingStore, RowMetadata, StoredRow,
};
