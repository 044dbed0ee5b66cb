//! Pre-cache configuration and store construction.

use std::{num::NonZeroUsize, path::PathBuf, str::FromStr, sync::Arc};

use super::store::{DiskStore, MemoryStore, ResponseStore};

/// Where primed responses are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum StoreKind {
    #[default]
    Memory,
    Disk,
}

impl StoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Disk => "disk",
        }
    }
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "disk" => Ok(Self::Disk),
            other => Err(format!("unknown store `{other}`, expected `memory` or `disk`")),
        }
    }
}

/// Resolved pre-cache settings. Defaults and validation live in
/// [`crate::config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreCacheConfig {
    /// When false the proxy forwards every request and ignores priming headers.
    pub enabled: bool,
    pub store: StoreKind,
    /// Directory for the disk store.
    pub directory: PathBuf,
    /// Capacity of the memory store.
    pub max_entries: NonZeroUsize,
}

impl From<&crate::config::PreCacheSettings> for PreCacheConfig {
    fn from(settings: &crate::config::PreCacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            store: settings.store,
            directory: settings.directory.clone(),
            max_entries: settings.max_entries,
        }
    }
}

impl PreCacheConfig {
    /// Open the configured store, creating the disk directory if needed.
    pub fn open_store(&self) -> Result<Arc<dyn ResponseStore>, std::io::Error> {
        Ok(match self.store {
            StoreKind::Memory => Arc::new(MemoryStore::new(self.max_entries)),
            StoreKind::Disk => Arc::new(DiskStore::new(self.directory.clone())?),
        })
    }
}
