//! On-disk vault store.
//!
//! A single JSON file holding the ledger snapshot: vault records, pending
//! actions and the time of the last status refresh.

use spellvault_core::builder::TransactionBuilder;
use spellvault_core::{LedgerSnapshot, VaultLedger};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name inside the data directory.
pub const STORE_FILE: &str = "vaults.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct VaultStore {
    path: PathBuf,
}

impl VaultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot, or an empty one if the file does not exist yet.
    pub fn load(&self) -> Result<LedgerSnapshot, StoreError> {
        if self.path.exists() {
            let contents = fs::read_to_string(&self.path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(LedgerSnapshot::default())
        }
    }

    /// Load straight into a ledger.
    pub fn load_ledger(&self, builder: TransactionBuilder) -> Result<VaultLedger, StoreError> {
        Ok(VaultLedger::from_snapshot(self.load()?, builder))
    }

    /// Write the snapshot, creating the parent directory if needed.
    pub fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(snapshot)?;
        // Write then rename so a crash never leaves a truncated store
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
