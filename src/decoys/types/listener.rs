use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::decoys::types::{ConnectionCallback, DecoyConnectionEvent};
use crate::error::{Result, SensorError};

const REQUEST_LINE_TIMEOUT: Duration = Duration::from_secs(10);
const HEADER_TIMEOUT: Duration = Duration::from_secs(5);
const BODY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_BODY: usize = 4096;

/// Parsed inbound HTTP request.
#[derive(Debug, Clone)]
pub(crate) struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Response produced by a decoy responder.
#[derive(Debug, Clone)]
pub(crate) struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn html(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type".to_string(), "text/html; charset=utf-8".to_string())],
            body: body.into(),
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type".to_string(), "text/plain; charset=utf-8".to_string())],
            body: body.into(),
        }
    }

    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

pub(crate) type Responder = Arc<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

pub(crate) enum ListenerMode {
    Http(Responder),
    /// Banner replay for non-HTTP ports: send the greeting, log whatever
    /// the client sends back.
    Banner(String),
}

pub(crate) struct ListenerConfig {
    pub bind_address: String,
    /// Port to bind; 0 asks the OS for one.
    pub bind_port: u16,
    /// Port reported in connection events (differs from bind_port for
    /// privileged-port remaps). None means the bound port.
    pub advertised_port: Option<u16>,
    pub mode: ListenerMode,
    pub server_header: Option<String>,
    pub credential_values: HashSet<String>,
    pub callback: Option<ConnectionCallback>,
}

struct Shared {
    advertised_port: u16,
    mode: ListenerMode,
    server_header: Option<String>,
    credential_values: HashSet<String>,
    callback: Option<ConnectionCallback>,
}

/// A bound, serving decoy listener.
pub(crate) struct RunningListener {
    pub port: u16,
    alive: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl RunningListener {
    pub async fn start(config: ListenerConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.bind_address.as_str(), config.bind_port))
            .await
            .map_err(|e| {
                SensorError::Decoy(format!(
                    "bind {}:{} failed: {e}",
                    config.bind_address, config.bind_port
                ))
            })?;
        let port = listener.local_addr()?.port();

        let shared = Arc::new(Shared {
            advertised_port: config.advertised_port.unwrap_or(port),
            mode: config.mode,
            server_header: config.server_header,
            credential_values: config.credential_values,
            callback: config.callback,
        });

        let alive = Arc::new(AtomicBool::new(true));
        let alive_flag = alive.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, shared).await {
                                log::debug!("Decoy connection handler error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        log::debug!("Decoy accept error: {e}");
                        break;
                    }
                }
            }
            alive_flag.store(false, Ordering::SeqCst);
        });

        Ok(Self { port, alive, handle })
    }

    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.handle.is_finished()
    }

    pub fn stop(&mut self) {
        self.handle.abort();
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl Drop for RunningListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) -> std::io::Result<()> {
    let peer = stream.peer_addr().ok();
    let source_ip = peer.map(|p| p.ip().to_string()).unwrap_or_else(|| "0.0.0.0".to_string());
    let source_port = peer.map(|p| p.port()).unwrap_or(0);

    match &shared.mode {
        ListenerMode::Http(responder) => {
            handle_http(stream, &shared, responder.clone(), source_ip, source_port).await
        }
        ListenerMode::Banner(banner) => {
            handle_banner(stream, &shared, banner, source_ip, source_port).await
        }
    }
}

async fn handle_http(
    stream: TcpStream,
    shared: &Shared,
    responder: Responder,
    source_ip: String,
    source_port: u16,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);

    let request_line = match timeout(REQUEST_LINE_TIMEOUT, read_line(&mut reader)).await {
        Ok(Ok(line)) if !line.is_empty() => line,
        _ => return Ok(()),
    };
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("GET").to_string();
    let path = parts.next().unwrap_or("/").to_string();

    let mut headers: HashMap<String, String> = HashMap::new();
    let mut content_length = 0usize;
    loop {
        let line = match timeout(HEADER_TIMEOUT, read_line(&mut reader)).await {
            Ok(Ok(line)) => line,
            _ => break,
        };
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_lowercase();
            let value = value.trim().to_string();
            if key == "content-length" {
                content_length = value.parse().unwrap_or(0);
            }
            headers.insert(key, value);
        }
    }

    let mut body = String::new();
    if content_length > 0 {
        let mut buf = vec![0u8; content_length.min(MAX_BODY)];
        if let Ok(Ok(n)) = timeout(BODY_TIMEOUT, reader.read(&mut buf)).await {
            body = String::from_utf8_lossy(&buf[..n]).to_string();
        }
    }

    let credential_used = check_credentials(&shared.credential_values, &headers, &body);

    let request = HttpRequest {
        method,
        path: path.clone(),
        headers,
        body,
    };
    let response = responder(&request);
    let mut stream = reader.into_inner();
    write_response(&mut stream, &response, shared.server_header.as_deref()).await?;
    let _ = stream.shutdown().await;

    if let Some(callback) = &shared.callback {
        callback(DecoyConnectionEvent {
            source_ip,
            source_port,
            dest_port: shared.advertised_port,
            protocol: "tcp".to_string(),
            timestamp: Utc::now(),
            request_path: Some(path),
            credential_used,
        });
    }
    Ok(())
}

async fn handle_banner(
    mut stream: TcpStream,
    shared: &Shared,
    banner: &str,
    source_ip: String,
    source_port: u16,
) -> std::io::Result<()> {
    if !banner.is_empty() {
        let mut greeting = banner.to_string();
        if !greeting.ends_with("\r\n") {
            greeting.push_str("\r\n");
        }
        stream.write_all(greeting.as_bytes()).await?;
    }

    let mut buf = vec![0u8; 512];
    let body = match timeout(BODY_TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => String::from_utf8_lossy(&buf[..n]).to_string(),
        _ => String::new(),
    };
    let credential_used = check_credentials(&shared.credential_values, &HashMap::new(), &body);
    let _ = stream.shutdown().await;

    if let Some(callback) = &shared.callback {
        callback(DecoyConnectionEvent {
            source_ip,
            source_port,
            dest_port: shared.advertised_port,
            protocol: "tcp".to_string(),
            timestamp: Utc::now(),
            request_path: None,
            credential_used,
        });
    }
    Ok(())
}

async fn read_line(reader: &mut BufReader<TcpStream>) -> std::io::Result<String> {
    use tokio::io::AsyncBufReadExt;
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Scan request headers and body for any planted credential value.
fn check_credentials(
    credential_values: &HashSet<String>,
    headers: &HashMap<String, String>,
    body: &str,
) -> Option<String> {
    for value in credential_values {
        if headers.values().any(|header| header.contains(value)) {
            return Some(value.clone());
        }
        if body.contains(value) {
            return Some(value.clone());
        }
    }
    None
}

async fn write_response(
    stream: &mut TcpStream,
    response: &HttpResponse,
    server_header: Option<&str>,
) -> std::io::Result<()> {
    let status_text = status_text(response.status);
    let mut out = format!("HTTP/1.1 {} {}\r\n", response.status, status_text);

    let mut wrote_server = false;
    for (name, value) in &response.headers {
        if name.eq_ignore_ascii_case("server") {
            wrote_server = true;
        }
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    if let Some(server) = server_header {
        if !wrote_server {
            out.push_str(&format!("Server: {server}\r\n"));
        }
    }
    out.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    out.push_str("Connection: close\r\n\r\n");
    out.push_str(&response.body);

    stream.write_all(out.as_bytes()).await
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "OK",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    async fn http_get(port: u16, path: &str, body: Option<&str>) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request = match body {
            Some(b) => format!(
                "POST {path} HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n{b}",
                b.len()
            ),
            None => format!("GET {path} HTTP/1.1\r\nHost: x\r\n\r\n"),
        };
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    fn collecting_callback(events: Arc<Mutex<Vec<DecoyConnectionEvent>>>) -> ConnectionCallback {
        Arc::new(move |event| events.lock().unwrap().push(event))
    }

    #[tokio::test]
    async fn test_http_listener_serves_and_reports() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let responder: Responder = Arc::new(|req: &HttpRequest| {
            if req.path == "/" {
                HttpResponse::html("<h1>index</h1>")
            } else {
                HttpResponse::not_found()
            }
        });

        let listener = RunningListener::start(ListenerConfig {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 0,
            advertised_port: None,
            mode: ListenerMode::Http(responder),
            server_header: Some("nginx/1.18.0".to_string()),
            credential_values: HashSet::new(),
            callback: Some(collecting_callback(events.clone())),
        })
        .await
        .unwrap();
        assert!(listener.port > 0);
        assert!(listener.is_running());

        let response = http_get(listener.port, "/", None).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("Server: nginx/1.18.0"));
        assert!(response.contains("<h1>index</h1>"));

        // Handler runs in a spawned task; give it a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let captured = events.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].request_path.as_deref(), Some("/"));
        assert!(captured[0].credential_used.is_none());
    }

    #[tokio::test]
    async fn test_credential_detected_in_body() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let responder: Responder = Arc::new(|_req: &HttpRequest| HttpResponse::text("ok"));
        let mut credential_values = HashSet::new();
        credential_values.insert("AKIAXYZ12345EXAMPLE".to_string());

        let listener = RunningListener::start(ListenerConfig {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 0,
            advertised_port: None,
            mode: ListenerMode::Http(responder),
            server_header: None,
            credential_values,
            callback: Some(collecting_callback(events.clone())),
        })
        .await
        .unwrap();

        http_get(listener.port, "/login", Some("key=AKIAXYZ12345EXAMPLE")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let captured = events.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(
            captured[0].credential_used.as_deref(),
            Some("AKIAXYZ12345EXAMPLE")
        );
    }

    #[tokio::test]
    async fn test_banner_listener_sends_greeting() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let listener = RunningListener::start(ListenerConfig {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 0,
            advertised_port: Some(22),
            mode: ListenerMode::Banner("SSH-2.0-OpenSSH_8.9".to_string()),
            server_header: None,
            credential_values: HashSet::new(),
            callback: Some(collecting_callback(events.clone())),
        })
        .await
        .unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", listener.port)).await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"SSH-2.0-OpenSSH_8.9\r\n");
        drop(stream);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let captured = events.lock().unwrap();
        assert_eq!(captured.len(), 1);
        // Advertised port reported, not the bound one.
        assert_eq!(captured[0].dest_port, 22);
    }

    #[tokio::test]
    async fn test_stop_ends_serving() {
        let responder: Responder = Arc::new(|_req: &HttpRequest| HttpResponse::text("ok"));
        let mut listener = RunningListener::start(ListenerConfig {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 0,
            advertised_port: None,
            mode: ListenerMode::Http(responder),
            server_header: None,
            credential_values: HashSet::new(),
            callback: None,
        })
        .await
        .unwrap();

        let port = listener.port;
        listener.stop();
        assert!(!listener.is_running());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
}
