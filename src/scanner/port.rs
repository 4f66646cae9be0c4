use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::timeout;

/// An open port found on a host, with optional service metadata.
#[derive(Debug, Clone)]
pub struct PortScanResult {
    pub port: u16,
    pub service_name: Option<String>,
    pub banner: Option<String>,
}

/// Bounded-concurrency TCP connect scanner with banner grabbing.
pub struct PortScanner {
    timeout_per_port: Duration,
    max_concurrent: usize,
}

impl Default for PortScanner {
    fn default() -> Self {
        Self {
            timeout_per_port: Duration::from_millis(2000),
            max_concurrent: 100,
        }
    }
}

impl PortScanner {
    pub fn new(timeout_per_port: Duration, max_concurrent: usize) -> Self {
        Self {
            timeout_per_port,
            max_concurrent,
        }
    }

    /// Scan all targets for the given ports. Returns a map of IP to open
    /// ports; hosts with nothing open are omitted. Unreachable hosts and
    /// timeouts are treated as closed; never as errors.
    pub async fn scan_with_banners(
        &self,
        targets: &[String],
        ports: &[u16],
    ) -> HashMap<String, Vec<PortScanResult>> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut handles = Vec::new();

        for ip in targets {
            for &port in ports {
                let ip = ip.clone();
                let sem = semaphore.clone();
                let per_port = self.timeout_per_port;

                handles.push(tokio::spawn(async move {
                    let _permit = sem.acquire().await.ok()?;
                    scan_single_port(&ip, port, per_port).await.map(|r| (ip, r))
                }));
            }
        }

        let mut results: HashMap<String, Vec<PortScanResult>> = HashMap::new();
        for handle in handles {
            if let Ok(Some((ip, result))) = handle.await {
                results.entry(ip).or_default().push(result);
            }
        }
        for ports in results.values_mut() {
            ports.sort_by_key(|r| r.port);
        }
        results
    }
}

/// Connect to a single port; Some on open, None on closed/filtered.
async fn scan_single_port(ip: &str, port: u16, per_port: Duration) -> Option<PortScanResult> {
    let addr: SocketAddr = format!("{ip}:{port}").parse().ok()?;

    match timeout(per_port, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let banner = grab_banner(stream).await;
            Some(PortScanResult {
                port,
                service_name: service_name_for(port).map(str::to_string),
                banner,
            })
        }
        // Connection refused -> closed, timeout -> filtered. Either way,
        // not open.
        _ => None,
    }
}

/// Read whatever the service volunteers within a second.
async fn grab_banner(mut stream: TcpStream) -> Option<String> {
    let mut buf = vec![0u8; 256];
    match timeout(Duration::from_secs(1), stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            let banner = String::from_utf8_lossy(&buf[..n]).trim().to_string();
            if banner.is_empty() {
                None
            } else {
                Some(banner)
            }
        }
        _ => None,
    }
}

/// Well-known port to service name mapping.
fn service_name_for(port: u16) -> Option<&'static str> {
    match port {
        21 => Some("ftp"),
        22 => Some("ssh"),
        23 => Some("telnet"),
        25 => Some("smtp"),
        53 => Some("dns"),
        80 => Some("http"),
        110 => Some("pop3"),
        143 => Some("imap"),
        443 => Some("https"),
        445 => Some("smb"),
        548 => Some("afp"),
        554 => Some("rtsp"),
        587 => Some("submission"),
        631 => Some("ipp"),
        993 => Some("imaps"),
        995 => Some("pop3s"),
        1900 => Some("ssdp"),
        3000 | 3001 => Some("dev-server"),
        3306 => Some("mysql"),
        3389 => Some("rdp"),
        5000 => Some("upnp"),
        5173 => Some("vite"),
        5353 => Some("mdns"),
        5432 => Some("postgresql"),
        5900 => Some("vnc"),
        8000 => Some("http-alt"),
        8080 => Some("http-proxy"),
        8123 => Some("home-assistant"),
        8443 => Some("https-alt"),
        8888 => Some("http-alt2"),
        9090 => Some("prometheus"),
        9100 => Some("jetdirect"),
        _ => None,
    }
}
