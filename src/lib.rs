//! Detection relay
//!
//! Camera devices POST JPEG frames; the relay runs each frame through a hosted
//! detection workflow, counts detections of one target label above a
//! confidence threshold, and keeps the latest count per device.
//!
//! # Flow
//!
//! device → `api` → `relay` → `inference` → `detect` → `ledger` → `archive`
//!
//! Only the inference call can fail an upload. Local persistence, the remote
//! ledger backup and the image archive are best-effort and reported through
//! `error::BestEffort`.
//!
//! # Module Structure
//!
//! - `config`: layered configuration (file, environment, required secrets)
//! - `ledger`: per-device counts, lock, local file, ordered loading
//! - `archive`: remote content store and the best-effort archiver
//! - `inference`: workflow gateway trait and the hosted adapter
//! - `detect`: response parsing and label/threshold filtering
//! - `relay`: the upload pipeline and summary
//! - `api`: HTTP server

use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod archive;
pub mod config;
pub mod detect;
pub mod error;
pub mod inference;
pub mod ledger;
pub mod relay;

pub use archive::{Archiver, ContentStore, GithubContentStore, MemoryContentStore};
pub use config::{ArchiveSettings, DetectionProfile, ImageLayout, InferenceSettings, RelayConfig};
pub use detect::{parse_predictions, Detection, DetectionFilter};
pub use error::{BestEffort, Degraded, RelayError};
pub use inference::{InferenceGateway, RoboflowGateway};
pub use ledger::{DeviceRecord, Ledger, LedgerBackup, LedgerSnapshot, LedgerSource, LedgerStore};
pub use relay::{Relay, UploadRequest, UploadResponse};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
