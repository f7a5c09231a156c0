//! Per-device result ledger.
//!
//! One `DeviceRecord` per device id, replaced wholesale on each upload. The
//! ledger lives behind a single mutex inside `LedgerStore`; every mutation is
//! followed, under the same lock, by a local save and a remote backup attempt.

pub mod loader;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{BestEffort, Degraded};

pub use loader::{load_ledger, LedgerSource, LoadedFrom, LocalFileSource};

/// Latest result reported for one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub count: u64,
    /// Milliseconds since epoch.
    pub last_update: i64,
}

/// Device id -> latest record. Serialises as a flat JSON object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ledger {
    records: BTreeMap<String, DeviceRecord>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("decode ledger json")
    }

    pub fn to_json_pretty(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("encode ledger json")
    }

    /// Replace the record for `device_id`.
    pub fn upsert(&mut self, device_id: &str, record: DeviceRecord) {
        self.records.insert(device_id.to_string(), record);
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceRecord> {
        self.records.get(device_id)
    }

    /// Sum of `count` over all devices. Computed on every call.
    pub fn total(&self) -> u64 {
        self.records.values().map(|record| record.count).sum()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Point-in-time copy of the ledger taken under the store lock.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LedgerSnapshot {
    pub total_all_esp: u64,
    pub per_esp: Ledger,
}

impl LedgerSnapshot {
    fn of(ledger: &Ledger) -> Self {
        Self {
            total_all_esp: ledger.total(),
            per_esp: ledger.clone(),
        }
    }
}

/// Remote mirror for the whole ledger.
///
/// Called while the store lock is held, so implementations see writes in
/// commit order.
pub trait LedgerBackup: Send + Sync {
    fn backup_ledger(&self, ledger: &Ledger, device_id: &str) -> BestEffort;
}

/// Owns the in-memory ledger, its lock, and its local file.
pub struct LedgerStore {
    path: PathBuf,
    inner: Mutex<Ledger>,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>, ledger: Ledger) -> Self {
        Self {
            path: path.into(),
            inner: Mutex::new(ledger),
        }
    }

    /// Build the store by trying the local file, then each fallback source in
    /// order, then an empty ledger. Never fails.
    ///
    /// A ledger adopted from a fallback is written to the local file right away.
    pub fn open(path: impl Into<PathBuf>, fallbacks: &[&dyn LedgerSource]) -> Self {
        let path = path.into();
        let local = LocalFileSource::new(&path);
        let mut sources: Vec<&dyn LedgerSource> = Vec::with_capacity(fallbacks.len() + 1);
        sources.push(&local);
        sources.extend_from_slice(fallbacks);

        let (ledger, origin) = load_ledger(&sources);
        let store = Self::new(path, ledger);
        if let LoadedFrom::Fallback(name) = origin {
            log::info!("seeding local ledger from {}", name);
            let _ = store.save();
        }
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the record for `device_id`, save locally, then attempt the remote
    /// backup, all under one lock. Returns the snapshot taken after the update.
    pub fn record(
        &self,
        device_id: &str,
        count: u64,
        timestamp_ms: i64,
        backup: &dyn LedgerBackup,
    ) -> Result<LedgerSnapshot> {
        let mut ledger = self.lock()?;
        ledger.upsert(
            device_id,
            DeviceRecord {
                count,
                last_update: timestamp_ms,
            },
        );
        let _ = save_ledger(&self.path, &ledger);
        let _ = backup.backup_ledger(&ledger, device_id);
        Ok(LedgerSnapshot::of(&ledger))
    }

    pub fn snapshot(&self) -> Result<LedgerSnapshot> {
        let ledger = self.lock()?;
        Ok(LedgerSnapshot::of(&ledger))
    }

    /// Write the current ledger to the local file.
    pub fn save(&self) -> BestEffort {
        let ledger = self
            .lock()
            .map_err(|err| Degraded::LocalSave(err.to_string()))?;
        save_ledger(&self.path, &ledger)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Ledger>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("ledger lock poisoned"))
    }
}

/// Overwrite `path` with `ledger` via a sibling temp file and rename.
pub fn save_ledger(path: &Path, ledger: &Ledger) -> BestEffort {
    match write_atomic(path, ledger) {
        Ok(()) => {
            log::debug!("saved ledger to {}", path.display());
            Ok(())
        }
        Err(err) => {
            log::error!("ledger save to {} failed: {:#}", path.display(), err);
            Err(Degraded::LocalSave(format!("{:#}", err)))
        }
    }
}

fn write_atomic(path: &Path, ledger: &Ledger) -> Result<()> {
    let bytes = ledger.to_json_pretty()?;
    let mut tmp_name = path
        .file_name()
        .ok_or_else(|| anyhow!("ledger path has no file name"))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut file = std::fs::File::create(&tmp_path)
        .with_context(|| format!("create {}", tmp_path.display()))?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("rename {} over {}", tmp_path.display(), path.display()))?;
    Ok(())
}
