//! Inference gateway.
//!
//! The relay does no image work itself. It hands the uploaded frame to a
//! hosted detection workflow and gets JSON back; `detect` makes sense of it.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use std::path::Path;

use crate::config::InferenceSettings;

/// Runs a detection workflow over one image.
///
/// Implementations are shared across request threads.
pub trait InferenceGateway: Send + Sync {
    /// Backend identifier for logs.
    fn name(&self) -> &'static str;

    /// Run the workflow on the image at `image` and return the raw response.
    fn run_workflow(&self, image: &Path) -> Result<Value>;
}

/// Roboflow serverless workflow endpoint.
pub struct RoboflowGateway {
    endpoint: String,
    api_key: String,
    timeout: std::time::Duration,
}

impl RoboflowGateway {
    pub fn new(settings: &InferenceSettings) -> Self {
        Self {
            endpoint: format!(
                "{}/{}/workflows/{}",
                settings.api_url.trim_end_matches('/'),
                settings.workspace,
                settings.workflow_id
            ),
            api_key: settings.api_key.clone(),
            timeout: settings.timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl InferenceGateway for RoboflowGateway {
    fn name(&self) -> &'static str {
        "roboflow"
    }

    fn run_workflow(&self, image: &Path) -> Result<Value> {
        let bytes = std::fs::read(image)
            .with_context(|| format!("read spooled image {}", image.display()))?;
        let body = json!({
            "api_key": self.api_key,
            "inputs": {
                "image": { "type": "base64", "value": STANDARD.encode(&bytes) }
            },
            "use_cache": false,
        });
        let payload = serde_json::to_string(&body)?;

        let response = match ureq::post(&self.endpoint)
            .timeout(self.timeout)
            .set("Content-Type", "application/json")
            .send_string(&payload)
        {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                return Err(anyhow!(
                    "workflow returned status {}: {}",
                    code,
                    truncate(&detail, 512)
                ));
            }
            Err(err) => return Err(err).context("call inference workflow"),
        };
        let text = response
            .into_string()
            .context("read inference workflow response")?;
        let mut value: Value =
            serde_json::from_str(&text).context("inference workflow returned invalid json")?;

        Ok(match value.get_mut("outputs") {
            Some(outputs) => outputs.take(),
            None => value,
        })
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
