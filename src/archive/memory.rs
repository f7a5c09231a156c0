//! In-process `ContentStore` for tests and dry runs.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{ContentStore, PutRequest, PutStatus, RemoteObject};

/// In-process content store with SHA-256 revision markers.
///
/// Enforces the same conditional-write rules as the hosted store: creating a
/// path takes no marker, overwriting one takes the current marker.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    objects: Mutex<HashMap<String, RemoteObject>>,
    gets: AtomicUsize,
    puts: AtomicUsize,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `path` with `content`, bypassing revision checks.
    pub fn insert(&self, path: &str, content: &[u8]) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(path.to_string(), object_for(content));
        }
    }

    pub fn object(&self, path: &str) -> Option<RemoteObject> {
        self.objects.lock().ok()?.get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Number of put calls received, successful or not.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

fn object_for(content: &[u8]) -> RemoteObject {
    RemoteObject {
        content: content.to_vec(),
        sha: hex::encode(Sha256::digest(content)),
    }
}

impl ContentStore for MemoryContentStore {
    fn get(&self, path: &str) -> Result<Option<RemoteObject>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let objects = self
            .objects
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(objects.get(path).cloned())
    }

    fn put(&self, path: &str, request: &PutRequest) -> Result<PutStatus> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let content = STANDARD
            .decode(&request.content)
            .context("decode put content")?;
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        let status = match (objects.get(path), request.sha.as_deref()) {
            (None, None) => PutStatus::Created,
            (Some(current), Some(sha)) if current.sha == sha => PutStatus::Updated,
            _ => return Ok(PutStatus::Conflict),
        };
        objects.insert(path.to_string(), object_for(&content));
        Ok(status)
    }
}

impl<S: ContentStore + ?Sized> ContentStore for Arc<S> {
    fn get(&self, path: &str) -> Result<Option<RemoteObject>> {
        (**self).get(path)
    }

    fn put(&self, path: &str, request: &PutRequest) -> Result<PutStatus> {
        (**self).put(path, request)
    }
}
