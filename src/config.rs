use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_API_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_LEDGER_PATH: &str = "esp_results.json";
const DEFAULT_TARGET_LABEL: &str = "male";
const DEFAULT_MIN_CONFIDENCE: f64 = 0.6;
const DEFAULT_INFERENCE_URL: &str = "https://serverless.roboflow.com";
const DEFAULT_WORKSPACE: &str = "my-workspace-rrwxa";
const DEFAULT_WORKFLOW_ID: &str = "detect-count-and-visualize";
const DEFAULT_INFERENCE_TIMEOUT_SECS: u64 = 15;
const DEFAULT_GITHUB_API: &str = "https://api.github.com";
const DEFAULT_GITHUB_REPO: &str = "onlykartika/indukan-detect";
const DEFAULT_IMAGES_FOLDER: &str = "images";
const DEFAULT_REMOTE_LEDGER_PATH: &str = "esp_results.json";
const DEFAULT_USER_AGENT: &str = "detect-relay";

pub const INFERENCE_KEY_ENV: &str = "ROBOFLOW_API_KEY";
pub const ARCHIVE_TOKEN_ENV: &str = "GITHUB_TOKEN";

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    api: Option<ApiConfigFile>,
    ledger_path: Option<PathBuf>,
    spool_dir: Option<PathBuf>,
    detection: Option<DetectionConfigFile>,
    inference: Option<InferenceConfigFile>,
    archive: Option<ArchiveConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    target_label: Option<String>,
    min_confidence: Option<f64>,
    device_timestamp_header: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct InferenceConfigFile {
    api_url: Option<String>,
    workspace: Option<String>,
    workflow_id: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ArchiveConfigFile {
    api_base: Option<String>,
    repo: Option<String>,
    images_folder: Option<String>,
    ledger_path: Option<String>,
    layout: Option<ImageLayout>,
    folder_placeholder: Option<bool>,
    user_agent: Option<String>,
}

/// Where archived images go under the images folder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageLayout {
    /// `{images}/{device}/{file}`
    #[default]
    PerDevice,
    /// `{images}/{file}`
    Flat,
}

impl FromStr for ImageLayout {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "per_device" | "per-device" => Ok(ImageLayout::PerDevice),
            "flat" => Ok(ImageLayout::Flat),
            other => Err(anyhow!(
                "unknown image layout '{}'; expected per_device or flat",
                other
            )),
        }
    }
}

#[derive(Clone)]
pub struct RelayConfig {
    pub api_addr: String,
    /// Static bearer token for `/upload` and `/summary`. `None` leaves them open.
    pub api_token: Option<String>,
    pub ledger_path: PathBuf,
    /// Directory for transient upload files.
    pub spool_dir: PathBuf,
    pub detection: DetectionProfile,
    pub inference: InferenceSettings,
    pub archive: ArchiveSettings,
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("api_addr", &self.api_addr)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("ledger_path", &self.ledger_path)
            .field("spool_dir", &self.spool_dir)
            .field("detection", &self.detection)
            .field("inference", &self.inference)
            .field("archive", &self.archive)
            .finish()
    }
}

/// Per-deployment detection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionProfile {
    pub target_label: String,
    /// Unscaled, in `[0, 1]`.
    pub min_confidence: f64,
    /// Header carrying a device-side epoch-seconds timestamp, if trusted.
    pub device_timestamp_header: Option<String>,
}

impl Default for DetectionProfile {
    fn default() -> Self {
        Self {
            target_label: DEFAULT_TARGET_LABEL.to_string(),
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            device_timestamp_header: None,
        }
    }
}

#[derive(Clone)]
pub struct InferenceSettings {
    pub api_url: String,
    pub api_key: String,
    pub workspace: String,
    pub workflow_id: String,
    pub timeout: Duration,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_INFERENCE_URL.to_string(),
            api_key: String::new(),
            workspace: DEFAULT_WORKSPACE.to_string(),
            workflow_id: DEFAULT_WORKFLOW_ID.to_string(),
            timeout: Duration::from_secs(DEFAULT_INFERENCE_TIMEOUT_SECS),
        }
    }
}

impl std::fmt::Debug for InferenceSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceSettings")
            .field("api_url", &self.api_url)
            .field("api_key", &"<redacted>")
            .field("workspace", &self.workspace)
            .field("workflow_id", &self.workflow_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Clone)]
pub struct ArchiveSettings {
    pub api_base: String,
    /// `owner/name`
    pub repo: String,
    pub token: String,
    pub user_agent: String,
    pub images_folder: String,
    /// Remote path of the ledger blob.
    pub ledger_path: String,
    pub layout: ImageLayout,
    /// Create `{images}/{device}/.keep` before the first image of a device.
    pub folder_placeholder: bool,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_GITHUB_API.to_string(),
            repo: DEFAULT_GITHUB_REPO.to_string(),
            token: String::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            images_folder: DEFAULT_IMAGES_FOLDER.to_string(),
            ledger_path: DEFAULT_REMOTE_LEDGER_PATH.to_string(),
            layout: ImageLayout::PerDevice,
            folder_placeholder: false,
        }
    }
}

impl std::fmt::Debug for ArchiveSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveSettings")
            .field("api_base", &self.api_base)
            .field("repo", &self.repo)
            .field("token", &"<redacted>")
            .field("user_agent", &self.user_agent)
            .field("images_folder", &self.images_folder)
            .field("ledger_path", &self.ledger_path)
            .field("layout", &self.layout)
            .field("folder_placeholder", &self.folder_placeholder)
            .finish()
    }
}

impl RelayConfig {
    /// Load from the file named by `RELAY_CONFIG` (if any), then the environment.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("RELAY_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Load from `path` (if any), then apply environment overrides and secrets.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => RelayConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.inference.api_key = required_secret(INFERENCE_KEY_ENV)?;
        cfg.archive.token = required_secret(ARCHIVE_TOKEN_ENV)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Self {
        let api = file.api.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let inference = file.inference.unwrap_or_default();
        let archive = file.archive.unwrap_or_default();
        let archive_defaults = ArchiveSettings::default();
        let inference_defaults = InferenceSettings::default();

        Self {
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            api_token: api.token,
            ledger_path: file
                .ledger_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER_PATH)),
            spool_dir: file.spool_dir.unwrap_or_else(std::env::temp_dir),
            detection: DetectionProfile {
                target_label: detection
                    .target_label
                    .unwrap_or_else(|| DEFAULT_TARGET_LABEL.to_string()),
                min_confidence: detection.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE),
                device_timestamp_header: detection.device_timestamp_header,
            },
            inference: InferenceSettings {
                api_url: inference.api_url.unwrap_or(inference_defaults.api_url),
                api_key: String::new(),
                workspace: inference.workspace.unwrap_or(inference_defaults.workspace),
                workflow_id: inference.workflow_id.unwrap_or(inference_defaults.workflow_id),
                timeout: inference
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(inference_defaults.timeout),
            },
            archive: ArchiveSettings {
                api_base: archive.api_base.unwrap_or(archive_defaults.api_base),
                repo: archive.repo.unwrap_or(archive_defaults.repo),
                token: String::new(),
                user_agent: archive.user_agent.unwrap_or(archive_defaults.user_agent),
                images_folder: archive.images_folder.unwrap_or(archive_defaults.images_folder),
                ledger_path: archive.ledger_path.unwrap_or(archive_defaults.ledger_path),
                layout: archive.layout.unwrap_or(archive_defaults.layout),
                folder_placeholder: archive
                    .folder_placeholder
                    .unwrap_or(archive_defaults.folder_placeholder),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        // PORT only applies when no address was configured explicitly.
        if let Some(port) = env_nonempty("PORT") {
            let port: u16 = port
                .parse()
                .map_err(|_| anyhow!("PORT must be a TCP port number"))?;
            if self.api_addr == DEFAULT_API_ADDR {
                self.api_addr = format!("0.0.0.0:{}", port);
            }
        }
        if let Some(addr) = env_nonempty("RELAY_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(token) = env_nonempty("RELAY_API_TOKEN") {
            self.api_token = Some(token);
        }
        if let Some(path) = env_nonempty("RELAY_LEDGER_PATH") {
            self.ledger_path = PathBuf::from(path);
        }
        if let Some(dir) = env_nonempty("RELAY_SPOOL_DIR") {
            self.spool_dir = PathBuf::from(dir);
        }
        if let Some(label) = env_nonempty("RELAY_TARGET_LABEL") {
            self.detection.target_label = label;
        }
        if let Some(threshold) = env_nonempty("RELAY_MIN_CONFIDENCE") {
            self.detection.min_confidence = threshold
                .parse()
                .map_err(|_| anyhow!("RELAY_MIN_CONFIDENCE must be a number between 0 and 1"))?;
        }
        if let Some(header) = env_nonempty("RELAY_DEVICE_TIMESTAMP_HEADER") {
            self.detection.device_timestamp_header = Some(header);
        }
        if let Some(layout) = env_nonempty("RELAY_IMAGE_LAYOUT") {
            self.archive.layout = layout.parse()?;
        }
        if let Some(flag) = env_nonempty("RELAY_FOLDER_PLACEHOLDER") {
            self.archive.folder_placeholder = parse_bool(&flag).ok_or_else(|| {
                anyhow!("RELAY_FOLDER_PLACEHOLDER must be true/false")
            })?;
        }
        if let Some(repo) = env_nonempty("RELAY_GITHUB_REPO") {
            self.archive.repo = repo;
        }
        if let Some(url) = env_nonempty("ROBOFLOW_API_URL") {
            self.inference.api_url = url;
        }
        if let Some(workspace) = env_nonempty("ROBOFLOW_WORKSPACE") {
            self.inference.workspace = workspace;
        }
        if let Some(workflow) = env_nonempty("ROBOFLOW_WORKFLOW_ID") {
            self.inference.workflow_id = workflow;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.detection.target_label = self.detection.target_label.trim().to_string();
        if self.detection.target_label.is_empty() {
            return Err(anyhow!("target label must not be empty"));
        }
        let threshold = self.detection.min_confidence;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "min confidence must be within 0..=1, got {}",
                threshold
            ));
        }
        if let Some(header) = &self.detection.device_timestamp_header {
            if header.trim().is_empty() || header.contains(':') {
                return Err(anyhow!("invalid device timestamp header '{}'", header));
            }
        }
        match self.archive.repo.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {}
            _ => {
                return Err(anyhow!(
                    "archive repo must be owner/name, got '{}'",
                    self.archive.repo
                ))
            }
        }
        for (what, value) in [
            ("inference api url", &self.inference.api_url),
            ("archive api base", &self.archive.api_base),
        ] {
            url::Url::parse(value).map_err(|e| anyhow!("invalid {} '{}': {}", what, value, e))?;
        }
        if self.inference.workspace.trim().is_empty() || self.inference.workflow_id.trim().is_empty()
        {
            return Err(anyhow!("inference workspace and workflow id must be set"));
        }
        if self.api_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            self.api_token = None;
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg: RelayConfigFile = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn required_secret(key: &str) -> Result<String> {
    env_nonempty(key).ok_or_else(|| anyhow!("{} environment variable is required", key))
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
