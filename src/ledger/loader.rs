//! Ordered ledger loading.
//!
//! Each source answers found / not found / error. `load_ledger` walks the
//! sources in order and adopts the first hit; errors are logged and skipped.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::Ledger;

/// Somewhere a previously persisted ledger may be found.
pub trait LedgerSource {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// `Ok(None)` when nothing is stored there yet.
    fn fetch(&self) -> Result<Option<Ledger>>;
}

/// Which source the ledger came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadedFrom {
    /// The first source in the list.
    Primary,
    /// A later source, named.
    Fallback(String),
    /// No source had a ledger.
    Empty,
}

pub fn load_ledger(sources: &[&dyn LedgerSource]) -> (Ledger, LoadedFrom) {
    for (index, source) in sources.iter().enumerate() {
        match source.fetch() {
            Ok(Some(ledger)) => {
                log::info!(
                    "loaded ledger from {} ({} devices)",
                    source.name(),
                    ledger.len()
                );
                let origin = if index == 0 {
                    LoadedFrom::Primary
                } else {
                    LoadedFrom::Fallback(source.name().to_string())
                };
                return (ledger, origin);
            }
            Ok(None) => log::debug!("no ledger stored at {}", source.name()),
            Err(err) => log::warn!("failed to load ledger from {}: {:#}", source.name(), err),
        }
    }
    log::info!("starting with an empty ledger");
    (Ledger::new(), LoadedFrom::Empty)
}

/// Ledger JSON file on local disk.
pub struct LocalFileSource {
    path: PathBuf,
    name: String,
}

impl LocalFileSource {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            name: format!("local file {}", path.display()),
        }
    }
}

impl LedgerSource for LocalFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self) -> Result<Option<Ledger>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()))
            }
        };
        Ledger::from_json(&bytes).map(Some)
    }
}
