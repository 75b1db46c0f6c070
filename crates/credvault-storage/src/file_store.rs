use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use credvault_core::storage::{BackingStore, BackingStoreError, RowMetadata, StoredRow};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{instrument, warn};

const ROW_EXTENSION: &str = "json";

/// One JSON file per identity under `root`. Values are already envelopes;
/// this layer only provides atomic replacement and listing.
pub struct FileBackingStore {
    root: PathBuf,
}

impl FileBackingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, identity: &str) -> PathBuf {
        self.root
            .join(format!("{}.{ROW_EXTENSION}", URL_SAFE_NO_PAD.encode(identity)))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RowFile {
    identity: String,
    value: String,
    authority_url: String,
}

impl BackingStore for FileBackingStore {
    #[instrument(skip_all, fields(identity = %identity))]
    fn read(&self, identity: &str) -> Result<Option<StoredRow>, BackingStoreError> {
        let Some(bytes) = read_file(&self.path_for(identity))? else {
            return Ok(None);
        };
        let corrupt = |reason: String| BackingStoreError::CorruptRow {
            identity: identity.to_string(),
            reason,
        };

        let row: RowFile = serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
        if row.identity != identity {
            return Err(corrupt(format!("row file names {}", row.identity)));
        }
        let value = STANDARD
            .decode(row.value)
            .map_err(|e| corrupt(e.to_string()))?;
        Ok(Some(StoredRow {
            value,
            metadata: RowMetadata {
                authority_url: row.authority_url,
            },
        }))
    }

    #[instrument(skip_all, fields(identity = %identity))]
    fn write(
        &self,
        identity: &str,
        value: &[u8],
        metadata: &RowMetadata,
    ) -> Result<(), BackingStoreError> {
        if identity.is_empty() {
            return Err(BackingStoreError::InvalidIdentity {
                reason: "identity is empty".to_string(),
            });
        }
        let row = RowFile {
            identity: identity.to_string(),
            value: STANDARD.encode(value),
            authority_url: metadata.authority_url.clone(),
        };
        write_row(&self.path_for(identity), &row)
    }

    #[instrument(skip_all, fields(identity = %identity))]
    fn delete(&self, identity: &str) -> Result<(), BackingStoreError> {
        match fs::remove_file(self.path_for(identity)) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_err(err)),
        }
    }

    fn list(&self) -> Result<Vec<String>, BackingStoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(storage_err(err)),
        };

        let mut identities = Vec::new();
        for entry in entries {
            let path = entry.map_err(storage_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ROW_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match URL_SAFE_NO_PAD
                .decode(stem)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
            {
                Some(identity) => identities.push(identity),
                None => warn!(?path, "skipping row file with undecodable name"),
            }
        }
        Ok(identities)
    }
}

fn write_row(path: &Path, row: &RowFile) -> Result<(), BackingStoreError> {
    let parent = path.parent().ok_or_else(|| BackingStoreError::Storage {
        reason: "invalid storage path".to_string(),
    })?;
    fs::create_dir_all(parent).map_err(storage_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(storage_err)?;
    let json = serde_json::to_vec(row).map_err(storage_err)?;
    tmp.write_all(&json).map_err(storage_err)?;
    tmp.flush().map_err(storage_err)?;
    tmp.persist(path).map_err(|e| storage_err(e.error))?;
    Ok(())
}

fn read_file(path: &Path) -> Result<Option<Vec<u8>>, BackingStoreError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(storage_err(err)),
    };

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(storage_err)?;
    Ok(Some(buf))
}

fn storage_err<E: ToString>(err: E) -> BackingStoreError {
    BackingStoreError::Storage {
        reason: err.to_string(),
    }
}
