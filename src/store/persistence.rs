//! Durable backing for the assignment store.
//!
//! The core only needs a blocking load/save pair. Callers on the async side run
//! these through `tokio::task::spawn_blocking`.

use crate::error::{Result, SyncError};
use crate::model::types::Assignment;

use parking_lot::Mutex;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub trait PersistenceBackend: Send + Sync {
    /// Every persisted assignment version.
    fn load(&self) -> Result<Vec<Assignment>>;

    /// Overwrites the persisted history.
    fn save(&self, history: &[Assignment]) -> Result<()>;
}

/// Keeps the "persisted" history in memory. Useful for tests and for nodes
/// that rebuild their state from the proxy on every start.
#[derive(Default)]
pub struct MemoryBackend {
    history: Mutex<Vec<Assignment>>,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(history: Vec<Assignment>) -> Self {
        Self {
            history: Mutex::new(history),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Makes subsequent loads and saves fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn saved(&self) -> Vec<Assignment> {
        self.history.lock().clone()
    }
}

impl PersistenceBackend for MemoryBackend {
    fn load(&self) -> Result<Vec<Assignment>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::StoreUnavailable("memory backend offline".to_string()));
        }
        Ok(self.history.lock().clone())
    }

    fn save(&self, history: &[Assignment]) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::StoreUnavailable("memory backend offline".to_string()));
        }
        *self.history.lock() = history.to_vec();
        Ok(())
    }
}

/// Bincode-encoded history file, replaced atomically on every save.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl PersistenceBackend for FileBackend {
    fn load(&self) -> Result<Vec<Assignment>> {
        if !self.path.exists() {
            tracing::info!("No assignment file at {}, starting empty", self.path.display());
            return Ok(Vec::new());
        }
        let bytes = std::fs::read(&self.path)?;
        let history: Vec<Assignment> = bincode::deserialize(&bytes)?;
        Ok(history)
    }

    fn save(&self, history: &[Assignment]) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let encoded = bincode::serialize(history)?;
        let temp = self.temp_path();
        let mut file = File::create(&temp)?;
        file.write_all(&encoded)?;
        // Data must be on disk before the rename can make it visible.
        file.sync_all()?;
        drop(file);
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }
}
