//! Upload pipeline and summary.
//!
//! One upload runs strictly in sequence: spool the frame, run inference,
//! filter, archive the frame, record the count, answer. Only an empty body or
//! a failed inference call aborts the request; every step after inference is
//! best-effort.

use anyhow::{Context, Result};
use rand::RngCore;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::archive::Archiver;
use crate::config::DetectionProfile;
use crate::detect::{parse_predictions, Detection, DetectionFilter};
use crate::error::{BestEffort, Degraded, RelayError};
use crate::inference::InferenceGateway;
use crate::ledger::{Ledger, LedgerSnapshot, LedgerStore};

pub const DEVICE_ID_HEADER: &str = "X-ESP-ID";
pub const UNKNOWN_DEVICE: &str = "unknown";

const MAX_PATH_DEVICE_LEN: usize = 64;

/// One upload as received from a device.
#[derive(Debug, Clone, Copy)]
pub struct UploadRequest<'a> {
    pub body: &'a [u8],
    /// Raw `X-ESP-ID` header value.
    pub device_id: Option<&'a str>,
    /// Raw value of the configured device timestamp header.
    pub device_timestamp: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub esp_id: String,
    pub target_label: String,
    pub detected_count: u64,
    pub total_all_esp: u64,
    pub per_esp: Ledger,
    pub objects: Vec<Detection>,
    /// Whether the frame reached the remote archive. Informational only.
    pub archived: bool,
}

/// The relay service: owns the ledger and the outbound adapters.
pub struct Relay {
    gateway: Box<dyn InferenceGateway>,
    archiver: Archiver,
    ledger: LedgerStore,
    filter: DetectionFilter,
    timestamp_header: Option<String>,
    spool_dir: PathBuf,
}

impl Relay {
    pub fn new(
        profile: &DetectionProfile,
        spool_dir: impl Into<PathBuf>,
        gateway: Box<dyn InferenceGateway>,
        archiver: Archiver,
        ledger: LedgerStore,
    ) -> Self {
        Self {
            gateway,
            archiver,
            ledger,
            filter: DetectionFilter::new(profile.target_label.clone(), profile.min_confidence),
            timestamp_header: profile.device_timestamp_header.clone(),
            spool_dir: spool_dir.into(),
        }
    }

    /// Header the device timestamp is read from, if configured.
    pub fn timestamp_header(&self) -> Option<&str> {
        self.timestamp_header.as_deref()
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    pub fn health_text(&self) -> String {
        format!(
            "detect relay running ({} detection) - ready",
            self.filter.target_label()
        )
    }

    pub fn upload(&self, request: UploadRequest<'_>) -> Result<UploadResponse, RelayError> {
        if request.body.is_empty() {
            return Err(RelayError::InvalidInput("no image".to_string()));
        }

        let esp_id = device_id_or_unknown(request.device_id);
        let path_device = path_safe_device_id(&esp_id);
        let timestamp_ms = self.choose_timestamp_ms(request.device_timestamp);
        let filename = format!("{}_{}.jpg", path_device, timestamp_ms.div_euclid(1000));
        log::info!("upload from {}, {} bytes", esp_id, request.body.len());

        let spooled = SpooledImage::write(&self.spool_dir, &filename, request.body)
            .map_err(|err| RelayError::Internal(err.context("save image failed")))?;

        let response = match self.gateway.run_workflow(spooled.path()) {
            Ok(response) => response,
            Err(err) => {
                log::warn!("{} inference failed for {}: {:#}", self.gateway.name(), esp_id, err);
                return Err(RelayError::InferenceFailure {
                    detail: format!("{:#}", err),
                });
            }
        };
        log::debug!("{} inference finished for {}", self.gateway.name(), esp_id);

        let predictions = parse_predictions(&response);
        let objects = self.filter.apply(&predictions);
        let detected_count = objects.len() as u64;

        let archived = self
            .archive_spooled(&path_device, &filename, &spooled)
            .is_ok();
        drop(spooled);

        let snapshot = self
            .ledger
            .record(&esp_id, detected_count, timestamp_ms, &self.archiver)?;
        log::info!(
            "{}: {} x '{}' (total {})",
            esp_id,
            detected_count,
            self.filter.target_label(),
            snapshot.total_all_esp
        );

        Ok(UploadResponse {
            status: "ok",
            esp_id,
            target_label: self.filter.target_label().to_string(),
            detected_count,
            total_all_esp: snapshot.total_all_esp,
            per_esp: snapshot.per_esp,
            objects,
            archived,
        })
    }

    pub fn summary(&self) -> Result<LedgerSnapshot, RelayError> {
        Ok(self.ledger.snapshot()?)
    }

    fn archive_spooled(&self, device: &str, filename: &str, spooled: &SpooledImage) -> BestEffort {
        let bytes = std::fs::read(spooled.path()).map_err(|err| {
            log::warn!("re-read of {} failed: {}", spooled.path().display(), err);
            Degraded::ImageArchive(err.to_string())
        })?;
        self.archiver.upload_image(device, filename, &bytes)
    }

    fn choose_timestamp_ms(&self, device_value: Option<&str>) -> i64 {
        if self.timestamp_header.is_some() {
            if let Some(ms) = device_value.and_then(parse_device_timestamp_ms) {
                return ms;
            }
            log::debug!("device timestamp missing or invalid; using server time");
        }
        crate::now_ms()
    }
}

/// Trimmed header value, or `unknown` when absent or blank.
pub fn device_id_or_unknown(raw: Option<&str>) -> String {
    raw.map(str::trim)
        .filter(|id| !id.is_empty())
        .unwrap_or(UNKNOWN_DEVICE)
        .to_string()
}

/// Device id made safe for file names and remote paths.
pub fn path_safe_device_id(device_id: &str) -> String {
    let cleaned: String = device_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_PATH_DEVICE_LEN)
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        UNKNOWN_DEVICE.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Epoch seconds from a device header, as milliseconds.
fn parse_device_timestamp_ms(value: &str) -> Option<i64> {
    let secs: i64 = value.trim().parse().ok()?;
    if secs <= 0 {
        return None;
    }
    secs.checked_mul(1000)
}

/// Upload body on local disk for the duration of one request.
///
/// Removed on drop, so every exit path of the handler cleans it up.
struct SpooledImage {
    path: PathBuf,
}

impl SpooledImage {
    fn write(dir: &Path, filename: &str, bytes: &[u8]) -> Result<Self> {
        let mut nonce = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut nonce);
        let path = dir.join(format!("{}.{}.part", filename, hex::encode(nonce)));
        std::fs::write(&path, bytes)
            .with_context(|| format!("write spool file {}", path.display()))?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpooledImage {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => log::warn!("failed to remove {}: {}", self.path.display(), err),
        }
    }
}
