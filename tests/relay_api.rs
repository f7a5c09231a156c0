use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

use detect_relay::api::{ApiConfig, ApiHandle, ApiServer};
use detect_relay::archive::{ContentStore, PutRequest, PutStatus, RemoteObject};
use detect_relay::{
    ArchiveSettings, Archiver, DetectionProfile, InferenceGateway, Ledger, LedgerStore,
    MemoryContentStore, Relay,
};

/// Returns the same response for every frame.
struct FixedGateway {
    response: Value,
}

impl FixedGateway {
    fn new(response: Value) -> Self {
        Self { response }
    }
}

impl InferenceGateway for FixedGateway {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn run_workflow(&self, image: &Path) -> Result<Value> {
        assert!(image.exists(), "spooled frame must exist during inference");
        Ok(self.response.clone())
    }
}

/// Reports as many male detections as the ASCII digit the frame ends with.
struct DigitGateway;

impl InferenceGateway for DigitGateway {
    fn name(&self) -> &'static str {
        "digit"
    }

    fn run_workflow(&self, image: &Path) -> Result<Value> {
        let bytes = std::fs::read(image)?;
        let n = bytes
            .last()
            .and_then(|b| (*b as char).to_digit(10))
            .ok_or_else(|| anyhow!("frame has no trailing digit"))?;
        let predictions: Vec<Value> = (0..n)
            .map(|_| json!({"class": "male", "confidence": 0.9}))
            .collect();
        Ok(json!([{ "predictions": predictions }]))
    }
}

struct FailingGateway;

impl InferenceGateway for FailingGateway {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn run_workflow(&self, _image: &Path) -> Result<Value> {
        Err(anyhow!("workflow returned status 503: busy"))
    }
}

struct DownStore;

impl ContentStore for DownStore {
    fn get(&self, _path: &str) -> Result<Option<RemoteObject>> {
        Err(anyhow!("connection refused"))
    }

    fn put(&self, _path: &str, _request: &PutRequest) -> Result<PutStatus> {
        Err(anyhow!("connection refused"))
    }
}

struct TestRelay {
    dir: TempDir,
    api_handle: Option<ApiHandle>,
}

impl TestRelay {
    fn start(
        gateway: Box<dyn InferenceGateway>,
        store: Box<dyn ContentStore>,
        token: Option<&str>,
    ) -> Result<Self> {
        Self::start_with_profile(&DetectionProfile::default(), gateway, store, token)
    }

    fn start_with_profile(
        profile: &DetectionProfile,
        gateway: Box<dyn InferenceGateway>,
        store: Box<dyn ContentStore>,
        token: Option<&str>,
    ) -> Result<Self> {
        let dir = tempdir()?;
        std::fs::create_dir(dir.path().join("spool"))?;
        let archiver = Archiver::new(store, &ArchiveSettings::default());
        let ledger = LedgerStore::new(dir.path().join("esp_results.json"), Ledger::new());
        let relay = Relay::new(
            profile,
            dir.path().join("spool"),
            gateway,
            archiver,
            ledger,
        );
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            token: token.map(str::to_string),
        };
        let api_handle = ApiServer::new(api_config, Arc::new(relay)).spawn()?;
        Ok(Self {
            dir,
            api_handle: Some(api_handle),
        })
    }

    fn addr(&self) -> SocketAddr {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
            .addr
    }

    fn spool_entries(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("spool"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    fn ledger_file(&self) -> PathBuf {
        self.dir.path().join("esp_results.json")
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn send(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Result<(String, String)> {
    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
    let mut raw = request.into_bytes();
    raw.extend_from_slice(body);
    send_raw(addr, &raw)
}

/// Write `raw` verbatim and split the response into head and body.
fn send_raw(addr: SocketAddr, raw: &[u8]) -> Result<(String, String)> {
    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(raw)?;

    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let head = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((head, body))
}

fn male_at(confidence: f64) -> Value {
    json!({"predictions": [{"class": "male", "confidence": confidence}]})
}

#[test]
fn upload_reports_filtered_detections_and_totals() -> Result<()> {
    let store = Arc::new(MemoryContentStore::new());
    let relay = TestRelay::start(
        Box::new(FixedGateway::new(male_at(0.8))),
        Box::new(store.clone()),
        None,
    )?;

    let frame = vec![0xABu8; 500];
    let (head, body) = send(relay.addr(), "POST", "/upload", &[("X-ESP-ID", "cam1")], &frame)?;
    assert!(head.contains("200 OK"), "{head}");

    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["status"], "ok");
    assert_eq!(value["esp_id"], "cam1");
    assert_eq!(value["detected_count"], 1);
    assert_eq!(value["objects"], json!([{"label": "male", "confidence": 80.0}]));
    assert_eq!(value["total_all_esp"], 1);
    assert_eq!(value["per_esp"]["cam1"]["count"], 1);
    assert_eq!(value["archived"], true);

    let archived: Vec<String> = store.paths();
    assert!(archived.iter().any(|p| p.starts_with("images/cam1/cam1_") && p.ends_with(".jpg")));
    assert!(archived.contains(&"esp_results.json".to_string()));
    assert_eq!(relay.spool_entries(), 0);
    Ok(())
}

#[test]
fn below_threshold_and_other_labels_are_not_counted() -> Result<()> {
    let response = json!([
        {"predictions": [
            {"class": "male", "confidence": 0.59},
            {"class": "female", "confidence": 0.99},
            {"label": "MALE", "score": 0.61}
        ]}
    ]);
    let relay = TestRelay::start(
        Box::new(FixedGateway::new(response)),
        Box::new(MemoryContentStore::new()),
        None,
    )?;

    let (_, body) = send(relay.addr(), "POST", "/upload", &[("X-ESP-ID", "cam2")], b"jpeg")?;
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["detected_count"], 1);
    assert_eq!(value["objects"][0]["label"], "MALE");
    assert_eq!(value["objects"][0]["confidence"], 61.0);
    Ok(())
}

#[test]
fn empty_body_is_rejected_regardless_of_headers() -> Result<()> {
    let relay = TestRelay::start(
        Box::new(FixedGateway::new(male_at(0.8))),
        Box::new(MemoryContentStore::new()),
        Some("s3cret"),
    )?;

    for headers in [
        vec![],
        vec![("X-ESP-ID", "cam1")],
        vec![("X-ESP-ID", "cam1"), ("Authorization", "Bearer s3cret")],
    ] {
        let (head, body) = send(relay.addr(), "POST", "/upload", &headers, b"")?;
        assert!(head.contains("400 Bad Request"), "{head}");
        let value: Value = serde_json::from_str(&body)?;
        assert!(value.get("error").is_some());
    }
    Ok(())
}

#[test]
fn missing_device_header_records_unknown() -> Result<()> {
    let relay = TestRelay::start(
        Box::new(FixedGateway::new(male_at(0.7))),
        Box::new(MemoryContentStore::new()),
        None,
    )?;
    let (_, body) = send(relay.addr(), "POST", "/upload", &[], b"jpeg")?;
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["esp_id"], "unknown");
    assert_eq!(value["per_esp"]["unknown"]["count"], 1);
    Ok(())
}

#[test]
fn inference_failure_returns_500_and_cleans_spool() -> Result<()> {
    let relay = TestRelay::start(
        Box::new(FailingGateway),
        Box::new(MemoryContentStore::new()),
        None,
    )?;

    let (head, body) = send(relay.addr(), "POST", "/upload", &[("X-ESP-ID", "cam1")], b"jpeg")?;
    assert!(head.contains("500 Internal Server Error"), "{head}");
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["error"], "inference failed");
    assert!(value["detail"].as_str().unwrap_or("").contains("503"));
    assert_eq!(relay.spool_entries(), 0);
    assert!(!relay.ledger_file().exists());
    Ok(())
}

#[test]
fn archive_outage_does_not_fail_the_upload() -> Result<()> {
    let relay = TestRelay::start(
        Box::new(FixedGateway::new(male_at(0.9))),
        Box::new(DownStore),
        None,
    )?;

    let (head, body) = send(relay.addr(), "POST", "/upload", &[("X-ESP-ID", "cam1")], b"jpeg")?;
    assert!(head.contains("200 OK"), "{head}");
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["archived"], false);
    assert_eq!(value["detected_count"], 1);
    assert_eq!(relay.spool_entries(), 0);

    let on_disk = Ledger::from_json(&std::fs::read(relay.ledger_file())?)?;
    assert_eq!(on_disk.get("cam1").map(|r| r.count), Some(1));
    Ok(())
}

#[test]
fn concurrent_uploads_from_distinct_devices_are_both_recorded() -> Result<()> {
    let relay = TestRelay::start(
        Box::new(DigitGateway),
        Box::new(MemoryContentStore::new()),
        None,
    )?;
    let addr = relay.addr();

    let workers: Vec<_> = [("cam-a", "frame-2"), ("cam-b", "frame-3")]
        .into_iter()
        .map(|(device, frame)| {
            std::thread::spawn(move || {
                send(addr, "POST", "/upload", &[("X-ESP-ID", device)], frame.as_bytes())
            })
        })
        .collect();
    for worker in workers {
        let (head, _) = worker.join().map_err(|_| anyhow!("upload thread panicked"))??;
        assert!(head.contains("200 OK"), "{head}");
    }

    let (_, body) = send(addr, "GET", "/summary", &[], b"")?;
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["per_esp"]["cam-a"]["count"], 2);
    assert_eq!(value["per_esp"]["cam-b"]["count"], 3);
    assert_eq!(value["total_all_esp"], 5);
    Ok(())
}

#[test]
fn summary_total_matches_per_device_sum_and_is_stable() -> Result<()> {
    let relay = TestRelay::start(
        Box::new(DigitGateway),
        Box::new(MemoryContentStore::new()),
        None,
    )?;
    send(relay.addr(), "POST", "/upload", &[("X-ESP-ID", "cam1")], b"x4")?;
    send(relay.addr(), "POST", "/upload", &[("X-ESP-ID", "cam2")], b"x1")?;
    let (_, last) = send(relay.addr(), "POST", "/upload", &[("X-ESP-ID", "cam1")], b"x2")?;
    let last: Value = serde_json::from_str(&last)?;
    assert_eq!(last["total_all_esp"], 3);

    let (head, first) = send(relay.addr(), "GET", "/summary", &[], b"")?;
    assert!(head.contains("200 OK"));
    let (_, second) = send(relay.addr(), "GET", "/summary", &[], b"")?;
    assert_eq!(first, second);

    let value: Value = serde_json::from_str(&first)?;
    let per_esp = value["per_esp"].as_object().expect("per_esp object");
    let sum: u64 = per_esp.values().filter_map(|r| r["count"].as_u64()).sum();
    assert_eq!(value["total_all_esp"].as_u64(), Some(sum));
    assert_eq!(sum, 3);
    Ok(())
}

#[test]
fn bearer_token_guards_upload_and_summary_only() -> Result<()> {
    let relay = TestRelay::start(
        Box::new(FixedGateway::new(male_at(0.9))),
        Box::new(MemoryContentStore::new()),
        Some("s3cret"),
    )?;

    let (head, _) = send(relay.addr(), "GET", "/summary", &[], b"")?;
    assert!(head.contains("401 Unauthorized"));
    let (head, _) = send(relay.addr(), "POST", "/upload", &[("Authorization", "Bearer nope")], b"jpeg")?;
    assert!(head.contains("401 Unauthorized"));

    let (head, _) = send(
        relay.addr(),
        "POST",
        "/upload",
        &[("Authorization", "Bearer s3cret"), ("X-ESP-ID", "cam1")],
        b"jpeg",
    )?;
    assert!(head.contains("200 OK"));
    let (head, _) = send(relay.addr(), "GET", "/summary", &[("Authorization", "Bearer s3cret")], b"")?;
    assert!(head.contains("200 OK"));

    let (head, body) = send(relay.addr(), "GET", "/", &[], b"")?;
    assert!(head.contains("200 OK"));
    assert!(body.contains("male"));
    let (head, body) = send(relay.addr(), "GET", "/health", &[], b"")?;
    assert!(head.contains("200 OK"));
    assert!(body.contains(r#""status":"ok""#));
    Ok(())
}

#[test]
fn unknown_routes_and_methods() -> Result<()> {
    let relay = TestRelay::start(
        Box::new(FixedGateway::new(male_at(0.9))),
        Box::new(MemoryContentStore::new()),
        None,
    )?;
    let (head, _) = send(relay.addr(), "GET", "/upload", &[], b"")?;
    assert!(head.contains("405 Method Not Allowed"));
    let (head, _) = send(relay.addr(), "GET", "/events", &[], b"")?;
    assert!(head.contains("404 Not Found"));
    Ok(())
}

#[test]
fn configured_device_timestamp_is_used_for_record_and_file_name() -> Result<()> {
    let profile = DetectionProfile {
        device_timestamp_header: Some("X-Timestamp".to_string()),
        ..DetectionProfile::default()
    };
    let store = Arc::new(MemoryContentStore::new());
    let relay = TestRelay::start_with_profile(
        &profile,
        Box::new(FixedGateway::new(male_at(0.9))),
        Box::new(store.clone()),
        None,
    )?;

    let (_, body) = send(
        relay.addr(),
        "POST",
        "/upload",
        &[("X-ESP-ID", "cam1"), ("X-Timestamp", "1700000000")],
        b"jpeg",
    )?;
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["per_esp"]["cam1"]["last_update"], 1_700_000_000_000i64);
    assert!(store.object("images/cam1/cam1_1700000000.jpg").is_some());

    let (_, body) = send(
        relay.addr(),
        "POST",
        "/upload",
        &[("X-ESP-ID", "cam2"), ("X-Timestamp", "not-a-time")],
        b"jpeg",
    )?;
    let value: Value = serde_json::from_str(&body)?;
    let last_update = value["per_esp"]["cam2"]["last_update"].as_i64().unwrap_or(0);
    assert!(last_update > 1_700_000_000_000);
    Ok(())
}

#[test]
fn chunked_upload_is_reassembled() -> Result<()> {
    let relay = TestRelay::start(
        Box::new(DigitGateway),
        Box::new(MemoryContentStore::new()),
        None,
    )?;

    let raw = b"POST /upload HTTP/1.1\r\n\
Host: localhost\r\n\
X-ESP-ID: cam1\r\n\
Transfer-Encoding: chunked\r\n\
\r\n\
3;ext=1\r\nfra\r\n\
4\r\nme-3\r\n\
0\r\n\
X-Trailer: done\r\n\
\r\n";
    let (head, body) = send_raw(relay.addr(), raw)?;
    assert!(head.contains("200 OK"), "{head}");
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["esp_id"], "cam1");
    assert_eq!(value["detected_count"], 3);
    assert_eq!(relay.spool_entries(), 0);
    Ok(())
}

#[test]
fn chunked_upload_without_data_is_still_empty() -> Result<()> {
    let relay = TestRelay::start(
        Box::new(FixedGateway::new(male_at(0.9))),
        Box::new(MemoryContentStore::new()),
        None,
    )?;
    let raw = b"POST /upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n";
    let (head, body) = send_raw(relay.addr(), raw)?;
    assert!(head.contains("400 Bad Request"), "{head}");
    assert!(body.contains("no image"));
    Ok(())
}

#[test]
fn oversized_chunk_is_refused_before_reading_it() -> Result<()> {
    let relay = TestRelay::start(
        Box::new(FixedGateway::new(male_at(0.9))),
        Box::new(MemoryContentStore::new()),
        None,
    )?;
    let raw = b"POST /upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n600000\r\n";
    let (head, _) = send_raw(relay.addr(), raw)?;
    assert!(head.contains("413 Payload Too Large"), "{head}");
    Ok(())
}

#[test]
fn malformed_chunk_size_is_a_bad_request() -> Result<()> {
    let relay = TestRelay::start(
        Box::new(FixedGateway::new(male_at(0.9))),
        Box::new(MemoryContentStore::new()),
        None,
    )?;
    let raw = b"POST /upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
    let (head, body) = send_raw(relay.addr(), raw)?;
    assert!(head.contains("400 Bad Request"), "{head}");
    assert!(body.contains("bad_request"));
    Ok(())
}
