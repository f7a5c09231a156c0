//! GitHub contents API as a `ContentStore`.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::time::Duration;

use super::{ContentStore, PutRequest, PutStatus, RemoteObject};
use crate::config::ArchiveSettings;

const GET_TIMEOUT: Duration = Duration::from_secs(10);
const PUT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    /// Base64, wrapped at 60 columns.
    #[serde(default)]
    content: String,
    sha: String,
}

pub struct GithubContentStore {
    contents_url: String,
    authorization: String,
    user_agent: String,
}

impl GithubContentStore {
    pub fn new(settings: &ArchiveSettings) -> Self {
        Self {
            contents_url: format!(
                "{}/repos/{}/contents",
                settings.api_base.trim_end_matches('/'),
                settings.repo
            ),
            authorization: format!("token {}", settings.token),
            user_agent: settings.user_agent.clone(),
        }
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.contents_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: &str, path: &str, timeout: Duration) -> ureq::Request {
        ureq::request(method, &self.url_for(path))
            .timeout(timeout)
            .set("Authorization", &self.authorization)
            .set("User-Agent", &self.user_agent)
            .set("Accept", "application/vnd.github.v3+json")
    }
}

impl ContentStore for GithubContentStore {
    fn get(&self, path: &str) -> Result<Option<RemoteObject>> {
        let response = match self.request("GET", path, GET_TIMEOUT).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow!("github get {} returned status {}", path, code))
            }
            Err(err) => return Err(err).with_context(|| format!("github get {}", path)),
        };
        let body = response
            .into_string()
            .with_context(|| format!("read github response for {}", path))?;
        let parsed: ContentsResponse = serde_json::from_str(&body)
            .with_context(|| format!("parse github response for {}", path))?;
        let packed: String = parsed
            .content
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        let content = STANDARD
            .decode(packed)
            .with_context(|| format!("decode github content for {}", path))?;
        Ok(Some(RemoteObject {
            content,
            sha: parsed.sha,
        }))
    }

    fn put(&self, path: &str, request: &PutRequest) -> Result<PutStatus> {
        let mut body = serde_json::json!({
            "message": request.message,
            "content": request.content,
        });
        if let Some(sha) = &request.sha {
            body["sha"] = serde_json::Value::String(sha.clone());
        }
        let payload = serde_json::to_string(&body)?;
        let result = self
            .request("PUT", path, PUT_TIMEOUT)
            .set("Content-Type", "application/json")
            .send_string(&payload);
        match result {
            Ok(response) if response.status() == 201 => Ok(PutStatus::Created),
            Ok(_) => Ok(PutStatus::Updated),
            Err(ureq::Error::Status(409 | 422, _)) => Ok(PutStatus::Conflict),
            Err(ureq::Error::Status(code, _)) => Ok(PutStatus::Rejected(code)),
            Err(err) => Err(err).with_context(|| format!("github put {}", path)),
        }
    }
}
