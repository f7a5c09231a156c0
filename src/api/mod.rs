use crate::config::DEFAULT_API_ADDR;
use crate::error::RelayError;
use crate::relay::{Relay, UploadRequest, DEVICE_ID_HEADER};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Static bearer token for `/upload` and `/summary`.
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_API_ADDR.to_string(),
            token: None,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    relay: Arc<Relay>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, relay: Arc<Relay>) -> Self {
        Self { cfg, relay }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = Arc::new(self.cfg);
        let relay = self.relay;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, relay, shutdown_thread) {
                log::error!("relay api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: Arc<ApiConfig>,
    relay: Arc<Relay>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let cfg = cfg.clone();
                let relay = relay.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &cfg, &relay) {
                        log::warn!("request from {} failed: {:#}", peer, err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, cfg: &ApiConfig, relay: &Relay) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(RequestError::TooLarge) => {
            write_json_response(&mut stream, 413, r#"{"error":"payload_too_large"}"#)?;
            return Ok(());
        }
        Err(RequestError::Malformed(err)) => {
            write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#)?;
            return Err(err);
        }
    };

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") => write_response(
            &mut stream,
            200,
            "text/plain; charset=utf-8",
            relay.health_text().as_bytes(),
        ),
        ("GET", "/health") => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        ("GET", "/summary") => {
            let result = authorize(&request, cfg).and_then(|()| relay.summary());
            write_result(&mut stream, result)
        }
        ("POST", "/upload") => {
            let result = reject_empty(&request)
                .and_then(|()| authorize(&request, cfg))
                .and_then(|()| {
                    let device_timestamp = relay
                        .timestamp_header()
                        .and_then(|name| request.header(name));
                    relay.upload(UploadRequest {
                        body: &request.body,
                        device_id: request.header(DEVICE_ID_HEADER),
                        device_timestamp,
                    })
                });
            write_result(&mut stream, result)
        }
        (_, "/" | "/health" | "/summary" | "/upload") => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

/// Empty uploads get a 400 before anything else is looked at.
fn reject_empty(request: &HttpRequest) -> Result<(), RelayError> {
    if request.body.is_empty() {
        return Err(RelayError::InvalidInput("no image".to_string()));
    }
    Ok(())
}

fn authorize(request: &HttpRequest, cfg: &ApiConfig) -> Result<(), RelayError> {
    let Some(expected) = cfg.token.as_deref() else {
        return Ok(());
    };
    match request.bearer_token() {
        Some(presented) if presented == expected => Ok(()),
        _ => Err(RelayError::Unauthorized),
    }
}

fn write_result<T: Serialize>(stream: &mut TcpStream, result: Result<T, RelayError>) -> Result<()> {
    match result {
        Ok(value) => {
            let payload = serde_json::to_vec(&value)?;
            write_response(stream, 200, "application/json", &payload)
        }
        Err(err) => {
            if err.status() >= 500 {
                log::warn!("request failed: {}", err);
            }
            let payload = serde_json::to_vec(&err.body())?;
            write_response(stream, err.status(), "application/json", &payload)
        }
    }
}

enum RequestError {
    TooLarge,
    Malformed(anyhow::Error),
}

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        RequestError::Malformed(err.into())
    }
}

fn read_request(stream: &mut TcpStream) -> std::result::Result<HttpRequest, RequestError> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(RequestError::TooLarge);
        }
        read_more(stream, &mut data).map_err(|_| {
            RequestError::Malformed(anyhow!("connection closed before headers"))
        })?;
    };

    let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("empty request")))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("missing method")))?;
    let raw_path = parts
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("missing path")))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let body_framing = body_framing(&headers)?;
    let expects_continue = headers
        .get("expect")
        .is_some_and(|value| value.eq_ignore_ascii_case("100-continue"));
    if expects_continue && body_framing != BodyFraming::Length(0) {
        stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
    }

    let pending = data.split_off(header_end + 4);
    let body = match body_framing {
        BodyFraming::Length(content_length) => {
            read_sized_body(stream, pending, content_length)?
        }
        BodyFraming::Chunked => read_chunked_body(stream, pending)?,
    };

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        body,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Length(usize),
    Chunked,
}

/// `Transfer-Encoding: chunked` wins over `Content-Length`; no framing header
/// means no body.
fn body_framing(
    headers: &HashMap<String, String>,
) -> std::result::Result<BodyFraming, RequestError> {
    if let Some(encoding) = headers.get("transfer-encoding") {
        let last = encoding.rsplit(',').next().unwrap_or("").trim();
        if last.eq_ignore_ascii_case("chunked") {
            return Ok(BodyFraming::Chunked);
        }
        return Err(RequestError::Malformed(anyhow!(
            "unsupported transfer-encoding '{}'",
            encoding
        )));
    }
    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| RequestError::Malformed(anyhow!("invalid content-length")))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(RequestError::TooLarge);
    }
    Ok(BodyFraming::Length(content_length))
}

fn read_sized_body(
    stream: &mut TcpStream,
    mut body: Vec<u8>,
    content_length: usize,
) -> std::result::Result<Vec<u8>, RequestError> {
    while body.len() < content_length {
        read_more(stream, &mut body).map_err(|_| {
            RequestError::Malformed(anyhow!(
                "body truncated at {} of {} bytes",
                body.len(),
                content_length
            ))
        })?;
    }
    body.truncate(content_length);
    Ok(body)
}

/// Decode a chunked body. `pending` holds bytes already read past the headers.
fn read_chunked_body(
    stream: &mut TcpStream,
    mut pending: Vec<u8>,
) -> std::result::Result<Vec<u8>, RequestError> {
    let mut body = Vec::new();
    loop {
        let line = take_line(stream, &mut pending)?;
        let size_field = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_field, 16).map_err(|_| {
            RequestError::Malformed(anyhow!("invalid chunk size '{}'", size_field))
        })?;
        if size == 0 {
            // Trailer fields, if any, end with an empty line.
            while !take_line(stream, &mut pending)?.is_empty() {}
            return Ok(body);
        }
        if size > MAX_BODY_BYTES - body.len() {
            return Err(RequestError::TooLarge);
        }
        while pending.len() < size + 2 {
            read_more(stream, &mut pending)?;
        }
        if &pending[size..size + 2] != b"\r\n" {
            return Err(RequestError::Malformed(anyhow!("chunk not terminated by CRLF")));
        }
        body.extend_from_slice(&pending[..size]);
        pending.drain(..size + 2);
    }
}

fn take_line(
    stream: &mut TcpStream,
    pending: &mut Vec<u8>,
) -> std::result::Result<String, RequestError> {
    loop {
        if let Some(pos) = pending.windows(2).position(|w| w == b"\r\n") {
            let line = String::from_utf8_lossy(&pending[..pos]).into_owned();
            pending.drain(..pos + 2);
            return Ok(line);
        }
        if pending.len() > MAX_HEADER_BYTES {
            return Err(RequestError::Malformed(anyhow!("chunk header line too long")));
        }
        read_more(stream, pending)?;
    }
}

fn read_more(
    stream: &mut TcpStream,
    pending: &mut Vec<u8>,
) -> std::result::Result<(), RequestError> {
    let mut buf = [0u8; 8192];
    let n = stream.read(&mut buf)?;
    if n == 0 {
        return Err(RequestError::Malformed(anyhow!("connection closed mid-body")));
    }
    pending.extend_from_slice(&buf[..n]);
    Ok(())
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unauthorized",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn bearer_token(&self) -> Option<&str> {
        let value = self.header("authorization")?;
        let parts: Vec<&str> = value.split_whitespace().collect();
        if parts.len() == 2 && parts[0].eq_ignore_ascii_case("bearer") {
            return Some(parts[1]);
        }
        None
    }
}
