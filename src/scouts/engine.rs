use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::db::queries::profiles::{self as db_profiles, ServiceProfile};
use crate::db::DbPool;
use crate::error::Result;
use crate::timefmt;

/// Ports that serve HTTP and get a full GET probe.
const HTTP_PORTS: &[u16] = &[
    80, 443, 3000, 3001, 5000, 5173, 8000, 8008, 8080, 8081, 8083, 8086, 8088, 8123, 8200, 8443,
    8444, 8500, 8888, 9000, 9090,
];

/// Ports that use TLS and get certificate inspection.
const TLS_PORTS: &[u16] = &[443, 8443, 993, 995, 8883];

/// Protocol-specific ports for banner/version probing.
const PROTOCOL_PORTS: &[u16] = &[22, 21, 25, 587, 110, 143];

const MAX_BODY_SNIPPET: usize = 2048;
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const TLS_TIMEOUT: Duration = Duration::from_secs(5);
const BANNER_TIMEOUT: Duration = Duration::from_secs(5);
const BANNER_READ_TIMEOUT: Duration = Duration::from_secs(3);

const BROWSER_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7)";

/// Deep service fingerprinting: captures what an intruder would see when
/// probing each open port (HTTP responses, TLS certificates, protocol
/// banners). Results feed the mimic template generator.
pub struct ScoutEngine {
    pool: DbPool,
    semaphore: Arc<Semaphore>,
    http: reqwest::Client,
}

impl ScoutEngine {
    pub fn new(pool: DbPool, max_concurrent: usize) -> Self {
        Self {
            pool,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .danger_accept_invalid_certs(true)
                .redirect(reqwest::redirect::Policy::limited(2))
                .user_agent(BROWSER_UA)
                .build()
                .expect("reqwest client"),
        }
    }

    /// Scout every (device, ip, open ports) entry and persist profiles.
    /// Returns the number of profiles written. Probe failures are logged
    /// at debug and leave partial profiles; never errors.
    pub async fn scout_all(&self, device_ports: &[(i64, String, Vec<u16>)]) -> Result<usize> {
        let mut count = 0usize;
        for (device_id, ip, ports) in device_ports {
            let profiles = self.scout_device(*device_id, ip, ports).await;
            let conn = self.pool.get()?;
            for profile in profiles {
                db_profiles::upsert_profile(&conn, &profile)?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Probe all open ports on one device concurrently (bounded).
    pub async fn scout_device(
        &self,
        device_id: i64,
        ip: &str,
        ports: &[u16],
    ) -> Vec<ServiceProfile> {
        let mut handles = Vec::new();
        for &port in ports {
            let ip = ip.to_string();
            let semaphore = self.semaphore.clone();
            let http = self.http.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.ok()?;
                Some(scout_port(&http, device_id, &ip, port).await)
            }));
        }

        let mut profiles = Vec::new();
        for handle in handles {
            if let Ok(Some(profile)) = handle.await {
                profiles.push(profile);
            }
        }
        profiles
    }

    /// Stored profiles for one device, in port order.
    pub fn profiles_for_device(&self, device_id: i64) -> Result<Vec<ServiceProfile>> {
        let conn = self.pool.get()?;
        Ok(db_profiles::get_profiles_for_device(&conn, device_id)?)
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

/// Probe a single port with every applicable probe.
async fn scout_port(http: &reqwest::Client, device_id: i64, ip: &str, port: u16) -> ServiceProfile {
    let mut profile = ServiceProfile {
        device_id,
        ip_address: ip.to_string(),
        port,
        protocol: "tcp".to_string(),
        scouted_at: timefmt::now_iso(),
        ..Default::default()
    };

    let is_http = HTTP_PORTS.contains(&port);
    let is_tls = TLS_PORTS.contains(&port);
    let is_protocol = PROTOCOL_PORTS.contains(&port);

    if is_http {
        if let Err(e) = probe_http(http, &mut profile, ip, port, is_tls).await {
            log::debug!("HTTP probe failed for {ip}:{port}: {e}");
        }
    }
    if is_tls {
        if let Err(e) = probe_tls(&mut profile, ip, port).await {
            log::debug!("TLS probe failed for {ip}:{port}: {e}");
        }
    }
    // Generic banner read for protocol ports and anything unclassified.
    if (is_protocol && !is_http) || (!is_http && !is_tls) {
        if let Err(e) = probe_banner(&mut profile, ip, port).await {
            log::debug!("Banner probe failed for {ip}:{port}: {e}");
        }
    }

    profile
}

/// GET / and /favicon.ico with a browser UA; capture status, headers,
/// a body snippet, the Server header, and the favicon MD5.
async fn probe_http(
    http: &reqwest::Client,
    profile: &mut ServiceProfile,
    ip: &str,
    port: u16,
    use_tls: bool,
) -> Result<()> {
    let scheme = if use_tls { "https" } else { "http" };
    let base = format!("{scheme}://{ip}:{port}");

    let response = http.get(format!("{base}/")).send().await?;
    profile.http_status = Some(response.status().as_u16());
    profile.http_server_header = response
        .headers()
        .get("server")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    profile.http_headers = Some(
        response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect(),
    );
    let body = response.text().await.unwrap_or_default();
    if !body.is_empty() {
        let end = body
            .char_indices()
            .take_while(|(i, _)| *i < MAX_BODY_SNIPPET)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        profile.http_body_snippet = Some(body[..end].to_string());
    }

    // Favicon is optional; any failure just leaves the hash empty.
    if let Ok(favicon) = http.get(format!("{base}/favicon.ico")).send().await {
        if favicon.status().as_u16() == 200 {
            if let Ok(bytes) = favicon.bytes().await {
                if !bytes.is_empty() {
                    profile.favicon_hash = Some(format!("{:x}", md5::compute(&bytes)));
                }
            }
        }
    }
    Ok(())
}

/// Open TLS without verification and pull CN, issuer org, and expiry off
/// the peer certificate.
async fn probe_tls(profile: &mut ServiceProfile, ip: &str, port: u16) -> Result<()> {
    use rustls::pki_types::ServerName;

    let config = no_verify_tls_config();
    let connector = tokio_rustls::TlsConnector::from(config);
    let server_name = ServerName::try_from(ip.to_string())
        .map_err(|e| crate::error::SensorError::Privileged(format!("server name: {e}")))?;

    let tcp = timeout(TLS_TIMEOUT, TcpStream::connect((ip, port)))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "tls connect timeout"))??;
    let stream = timeout(TLS_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "tls handshake timeout"))??;

    let (_, session) = stream.get_ref();
    if let Some(certs) = session.peer_certificates() {
        if let Some(cert_der) = certs.first() {
            if let Ok((_, cert)) = x509_parser::parse_x509_certificate(cert_der.as_ref()) {
                profile.tls_cn = cert
                    .subject()
                    .iter_common_name()
                    .next()
                    .and_then(|cn| cn.as_str().ok())
                    .map(str::to_string);
                profile.tls_issuer = cert
                    .issuer()
                    .iter_organization()
                    .next()
                    .and_then(|org| org.as_str().ok())
                    .map(str::to_string);
                profile.tls_not_after = Some(cert.validity().not_after.to_string());
            }
        }
    }
    Ok(())
}

/// Read up to 512 bytes of greeting; keep the first line, capped at 256.
async fn probe_banner(profile: &mut ServiceProfile, ip: &str, port: u16) -> Result<()> {
    let mut stream = timeout(BANNER_TIMEOUT, TcpStream::connect((ip, port)))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "banner connect timeout"))??;

    let mut buf = vec![0u8; 512];
    if let Ok(Ok(n)) = timeout(BANNER_READ_TIMEOUT, stream.read(&mut buf)).await {
        if n > 0 {
            let text = String::from_utf8_lossy(&buf[..n]);
            let first_line = text.lines().next().unwrap_or("").trim();
            if !first_line.is_empty() {
                profile.protocol_version = Some(first_line.chars().take(256).collect());
            }
        }
    }
    Ok(())
}

/// TLS client config that accepts any certificate; scouting needs the
/// certificate contents, not trust.
fn no_verify_tls_config() -> Arc<rustls::ClientConfig> {
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    #[derive(Debug)]
    struct NoVerify;

    impl ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ED25519,
            ]
        }
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("tls protocol versions")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    Arc::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::db::queries::devices;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn fake_http_server(body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = vec![0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nServer: lighttpd/1.4.59\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_banner_probe_captures_first_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let _ = socket
                    .write_all(b"SSH-2.0-OpenSSH_9.6\r\nsecond line ignored\r\n")
                    .await;
            }
        });

        let mut profile = ServiceProfile::default();
        probe_banner(&mut profile, "127.0.0.1", port).await.unwrap();
        assert_eq!(profile.protocol_version.as_deref(), Some("SSH-2.0-OpenSSH_9.6"));
    }

    #[tokio::test]
    async fn test_scout_device_http_probe() {
        // Scouting targets the HTTP port list, so run the fake server and
        // probe it directly via probe_http.
        let port = fake_http_server("<html><title>IPC camera</title></html>").await;
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap();

        let mut profile = ServiceProfile::default();
        probe_http(&http, &mut profile, "127.0.0.1", port, false)
            .await
            .unwrap();

        assert_eq!(profile.http_status, Some(200));
        assert_eq!(profile.http_server_header.as_deref(), Some("lighttpd/1.4.59"));
        assert!(profile
            .http_body_snippet
            .as_deref()
            .unwrap()
            .contains("IPC camera"));
    }

    #[tokio::test]
    async fn test_scout_all_persists_partial_profiles() {
        let pool = db::init_test_db();
        let device_id = {
            let conn = pool.get().unwrap();
            devices::insert_device(&conn, "127.0.0.1", None, None, "Unknown", "camera", "t")
                .unwrap()
        };

        // An unreachable port still yields a (mostly empty) profile row.
        let engine = ScoutEngine::new(pool.clone(), 4);
        let closed_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let written = engine
            .scout_all(&[(device_id, "127.0.0.1".to_string(), vec![closed_port])])
            .await
            .unwrap();
        assert_eq!(written, 1);

        let conn = pool.get().unwrap();
        let profiles = db_profiles::get_profiles_for_device(&conn, device_id).unwrap();
        assert_eq!(profiles.len(), 1);
        assert!(profiles[0].http_status.is_none());
        assert!(profiles[0].protocol_version.is_none());
    }

    #[test]
    fn test_no_verify_config_builds() {
        let config = no_verify_tls_config();
        assert!(Arc::strong_count(&config) >= 1);
    }
}
