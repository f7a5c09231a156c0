//! Remote archive for images and the ledger.
//!
//! The remote side is a path-addressed content store that hands out a
//! revision marker on read and wants it back on overwrite. `Archiver` layers
//! the relay's best-effort semantics on top: nothing here fails a request.

mod github;
mod memory;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;

use crate::config::{ArchiveSettings, ImageLayout};
use crate::error::{BestEffort, Degraded};
use crate::ledger::{Ledger, LedgerBackup, LedgerSource};

pub use github::GithubContentStore;
pub use memory::MemoryContentStore;

const PLACEHOLDER_NAME: &str = ".keep";

/// Current content at a path plus its revision marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteObject {
    pub content: Vec<u8>,
    pub sha: String,
}

/// A write to the store. `content` is base64 on the wire.
#[derive(Clone, Debug)]
pub struct PutRequest {
    pub message: String,
    pub content: String,
    /// Required when overwriting an existing path.
    pub sha: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutStatus {
    Created,
    Updated,
    /// Revision marker missing or stale.
    Conflict,
    /// Any other non-success status.
    Rejected(u16),
}

impl PutStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, PutStatus::Created | PutStatus::Updated)
    }
}

/// Path-addressed store with conditional overwrite.
pub trait ContentStore: Send + Sync {
    /// `Ok(None)` when nothing exists at `path`.
    fn get(&self, path: &str) -> Result<Option<RemoteObject>>;

    fn put(&self, path: &str, request: &PutRequest) -> Result<PutStatus>;
}

/// Best-effort mirroring of images and the ledger to a `ContentStore`.
pub struct Archiver {
    store: Box<dyn ContentStore>,
    images_folder: String,
    ledger_path: String,
    layout: ImageLayout,
    folder_placeholder: bool,
    source_name: String,
}

impl Archiver {
    pub fn new(store: Box<dyn ContentStore>, settings: &ArchiveSettings) -> Self {
        Self {
            store,
            images_folder: settings.images_folder.trim_matches('/').to_string(),
            ledger_path: settings.ledger_path.trim_matches('/').to_string(),
            layout: settings.layout,
            folder_placeholder: settings.folder_placeholder,
            source_name: format!("remote {}", settings.ledger_path),
        }
    }

    /// Remote path an image for `device` lands at.
    pub fn image_path(&self, device: &str, filename: &str) -> String {
        match self.layout {
            ImageLayout::PerDevice => format!("{}/{}/{}", self.images_folder, device, filename),
            ImageLayout::Flat => format!("{}/{}", self.images_folder, filename),
        }
    }

    /// Upload raw image bytes. `device` must already be path-safe.
    pub fn upload_image(&self, device: &str, filename: &str, bytes: &[u8]) -> BestEffort {
        if self.folder_placeholder && self.layout == ImageLayout::PerDevice {
            if let Err(err) = self.ensure_folder(device) {
                log::warn!("folder placeholder for {} failed: {:#}", device, err);
            }
        }

        let path = self.image_path(device, filename);
        let request = PutRequest {
            message: format!("Upload from {}: {}", device, filename),
            content: STANDARD.encode(bytes),
            sha: None,
        };
        match self.store.put(&path, &request) {
            Ok(status) if status.is_success() => {
                log::info!("archived image {}", path);
                Ok(())
            }
            Ok(status) => {
                log::warn!("image archive to {} refused: {:?}", path, status);
                Err(Degraded::ImageArchive(format!("{:?}", status)))
            }
            Err(err) => {
                log::warn!("image archive to {} failed: {:#}", path, err);
                Err(Degraded::ImageArchive(format!("{:#}", err)))
            }
        }
    }

    /// Create `{images}/{device}/.keep` unless the store already has it.
    fn ensure_folder(&self, device: &str) -> Result<()> {
        let marker = format!("{}/{}/{}", self.images_folder, device, PLACEHOLDER_NAME);
        if self.store.get(&marker)?.is_some() {
            return Ok(());
        }
        let request = PutRequest {
            message: format!("Create folder for {}", device),
            content: String::new(),
            sha: None,
        };
        let status = self.store.put(&marker, &request)?;
        if !status.is_success() && status != PutStatus::Conflict {
            log::warn!("placeholder {} refused: {:?}", marker, status);
        }
        Ok(())
    }

    fn try_backup(&self, ledger: &Ledger, device_id: &str) -> Result<PutStatus> {
        let sha = self.store.get(&self.ledger_path)?.map(|object| object.sha);
        let body = serde_json::to_vec(ledger)?;
        let request = PutRequest {
            message: format!(
                "Update from {} - {}",
                device_id,
                Utc::now().format("%Y-%m-%d %H:%M UTC")
            ),
            content: STANDARD.encode(body),
            sha,
        };
        self.store.put(&self.ledger_path, &request)
    }
}

impl LedgerBackup for Archiver {
    fn backup_ledger(&self, ledger: &Ledger, device_id: &str) -> BestEffort {
        match self.try_backup(ledger, device_id) {
            Ok(status) if status.is_success() => {
                log::info!("ledger backed up to {}", self.ledger_path);
                Ok(())
            }
            Ok(status) => {
                log::warn!("ledger backup to {} refused: {:?}", self.ledger_path, status);
                Err(Degraded::RemoteBackup(format!("{:?}", status)))
            }
            Err(err) => {
                log::warn!("ledger backup to {} failed: {:#}", self.ledger_path, err);
                Err(Degraded::RemoteBackup(format!("{:#}", err)))
            }
        }
    }
}

impl LedgerSource for Archiver {
    fn name(&self) -> &str {
        &self.source_name
    }

    fn fetch(&self) -> Result<Option<Ledger>> {
        match self.store.get(&self.ledger_path)? {
            Some(object) => Ledger::from_json(&object.content).map(Some),
            None => Ok(None),
        }
    }
}
