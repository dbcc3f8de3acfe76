//! JSON file persistence for KioskMesh
//!
//! Every state file is one JSON document, replaced atomically: the new
//! contents go to a temporary file in the same directory which is synced and
//! then renamed over the target. A reader therefore sees either the old or
//! the new document, even if the mining node and an admin process write at
//! the same time.

use crate::blockchain::Block;
use crate::error::KioskError;
use crate::transaction::Transaction;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

pub const BLOCKCHAIN_FILE: &str = "blockchain.json";
pub const PENDING_FILE: &str = "pending.json";
pub const TOKENS_FILE: &str = "tokens.json";
pub const WALLET_FILE: &str = "wallet.json";
pub const STAKING_FILE: &str = "staking.json";
pub const NODE_KEY_FILE: &str = "node_key.json";
pub const TOKEN_KEY_FILE: &str = "token_key.json";

/// A typed JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonFile<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> JsonFile<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when the file does not exist yet.
    pub fn load(&self) -> Result<Option<T>, KioskError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(KioskError::Persistence(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        serde_json::from_slice(&raw).map(Some).map_err(|e| {
            KioskError::Persistence(format!("Corrupt file {}: {}", self.path.display(), e))
        })
    }

    pub fn save(&self, value: &T) -> Result<(), KioskError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| KioskError::Persistence(format!("Failed to serialize: {}", e)))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| {
            KioskError::Persistence(format!(
                "Failed to replace {}: {}",
                self.path.display(),
                e.error
            ))
        })?;
        Ok(())
    }

    /// Move an unreadable file out of the way so it survives for manual
    /// recovery. Returns the new location.
    pub fn quarantine(&self) -> Result<PathBuf, KioskError> {
        let mut target = self.path.clone().into_os_string();
        target.push(format!(".corrupt-{}", chrono::Utc::now().timestamp()));
        let target = PathBuf::from(target);
        fs::rename(&self.path, &target)?;
        Ok(target)
    }
}

/// Storage backend for the block chain and the transactions waiting to be
/// mined into it.
pub trait ChainStore: Send + Sync {
    fn save_chain(&self, chain: &[Block]) -> Result<(), KioskError>;
    fn load_chain(&self) -> Result<Option<Vec<Block>>, KioskError>;
    /// Set aside a chain that failed to load or validate.
    fn discard_corrupt(&self) -> Result<(), KioskError>;
    fn save_pending(&self, pending: &[Transaction]) -> Result<(), KioskError>;
    fn load_pending(&self) -> Result<Option<Vec<Transaction>>, KioskError>;
}

/// `blockchain.json` holds the chain as a JSON array, `pending.json` the
/// pending pool next to it.
pub struct JsonChainStore {
    file: JsonFile<Vec<Block>>,
    pending: JsonFile<Vec<Transaction>>,
}

impl JsonChainStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            file: JsonFile::new(data_dir.join(BLOCKCHAIN_FILE)),
            pending: JsonFile::new(data_dir.join(PENDING_FILE)),
        }
    }
}

impl ChainStore for JsonChainStore {
    fn save_chain(&self, chain: &[Block]) -> Result<(), KioskError> {
        self.file.save(&chain.to_vec())
    }

    fn load_chain(&self) -> Result<Option<Vec<Block>>, KioskError> {
        self.file.load()
    }

    fn save_pending(&self, pending: &[Transaction]) -> Result<(), KioskError> {
        self.pending.save(&pending.to_vec())
    }

    fn load_pending(&self) -> Result<Option<Vec<Transaction>>, KioskError> {
        self.pending.load()
    }

    fn discard_corrupt(&self) -> Result<(), KioskError> {
        if !self.file.path().exists() {
            return Ok(());
        }
        let moved = self.file.quarantine()?;
        tracing::warn!("Moved corrupt chain file to {}", moved.display());
        Ok(())
    }
}

/// Keeps the chain in memory only; used by tests and throwaway nodes.
#[derive(Default)]
pub struct InMemoryChainStore {
    chain: Mutex<Option<Vec<Block>>>,
    pending: Mutex<Option<Vec<Transaction>>>,
}

impl InMemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChainStore for InMemoryChainStore {
    fn save_chain(&self, chain: &[Block]) -> Result<(), KioskError> {
        *self.chain.lock() = Some(chain.to_vec());
        Ok(())
    }

    fn load_chain(&self) -> Result<Option<Vec<Block>>, KioskError> {
        Ok(self.chain.lock().clone())
    }

    fn discard_corrupt(&self) -> Result<(), KioskError> {
        *self.chain.lock() = None;
        Ok(())
    }

    fn save_pending(&self, pending: &[Transaction]) -> Result<(), KioskError> {
        *self.pending.lock() = Some(pending.to_vec());
        Ok(())
    }

    fn load_pending(&self) -> Result<Option<Vec<Transaction>>, KioskError> {
        Ok(self.pending.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_loads_as_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let file: JsonFile<HashMap<String, u32>> = JsonFile::new(dir.path().join("absent.json"));
        assert!(file.load().unwrap().is_none());
    }

    #[test]
    fn test_save_replaces_previous_contents() {
        let dir = tempfile::TempDir::new().unwrap();
        let file: JsonFile<Vec<u32>> = JsonFile::new(dir.path().join("nested/values.json"));

        file.save(&vec![1, 2, 3]).unwrap();
        file.save(&vec![4]).unwrap();
        assert_eq!(file.load().unwrap(), Some(vec![4]));
    }

    #[test]
    fn test_corrupt_file_is_an_error_and_can_be_quarantined() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("blockchain.json");
        fs::write(&path, b"[{\"index\": ").unwrap();

        let store = JsonChainStore::new(dir.path());
        assert!(matches!(store.load_chain(), Err(KioskError::Persistence(_))));

        store.discard_corrupt().unwrap();
        assert!(!path.exists());
        let moved = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("blockchain.json.corrupt-"));
        assert!(moved);
    }
}
