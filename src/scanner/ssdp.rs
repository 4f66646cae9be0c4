use std::collections::HashMap;
use std::time::Duration;

use regex::Regex;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::Result;

const SSDP_MULTICAST: &str = "239.255.255.250:1900";
const DESCRIPTION_TIMEOUT: Duration = Duration::from_secs(3);

/// One SSDP discovery hit, enriched from the device description document.
#[derive(Debug, Clone, Default)]
pub struct SsdpRecord {
    pub ip: String,
    pub friendly_name: Option<String>,
    pub manufacturer: Option<String>,
    pub model_name: Option<String>,
}

/// SSDP M-SEARCH scanner. Sends a multicast discovery probe, collects
/// responses for a bounded window, then fetches each responder's
/// description XML for friendly name / manufacturer / model.
pub struct SsdpScanner {
    response_window: Duration,
    client: reqwest::Client,
}

impl Default for SsdpScanner {
    fn default() -> Self {
        Self {
            response_window: Duration::from_secs(3),
            client: reqwest::Client::builder()
                .timeout(DESCRIPTION_TIMEOUT)
                .build()
                .expect("reqwest client"),
        }
    }
}

impl SsdpScanner {
    pub fn new(response_window: Duration) -> Self {
        Self {
            response_window,
            ..Default::default()
        }
    }

    pub async fn scan(&self) -> Result<Vec<SsdpRecord>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let request = "M-SEARCH * HTTP/1.1\r\n\
                       HOST: 239.255.255.250:1900\r\n\
                       MAN: \"ssdp:discover\"\r\n\
                       MX: 2\r\n\
                       ST: ssdp:all\r\n\r\n";
        socket.send_to(request.as_bytes(), SSDP_MULTICAST).await?;

        // Collect responses until the window closes. ip -> LOCATION url.
        let mut locations: HashMap<String, Option<String>> = HashMap::new();
        let deadline = tokio::time::Instant::now() + self.response_window;
        let mut buf = vec![0u8; 4096];

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((n, peer))) => {
                    let response = String::from_utf8_lossy(&buf[..n]);
                    let location = header_value(&response, "location");
                    locations.entry(peer.ip().to_string()).or_insert(location);
                }
                Ok(Err(e)) => {
                    log::debug!("SSDP recv error: {e}");
                    break;
                }
                Err(_) => break,
            }
        }

        let mut records = Vec::new();
        for (ip, location) in locations {
            let mut record = SsdpRecord {
                ip,
                ..Default::default()
            };
            if let Some(url) = location {
                if let Err(e) = self.enrich_from_description(&mut record, &url).await {
                    log::debug!("SSDP description fetch failed for {url}: {e}");
                }
            }
            records.push(record);
        }
        Ok(records)
    }

    async fn enrich_from_description(&self, record: &mut SsdpRecord, url: &str) -> Result<()> {
        let body = self.client.get(url).send().await?.text().await?;
        record.friendly_name = xml_field(&body, "friendlyName");
        record.manufacturer = xml_field(&body, "manufacturer");
        record.model_name = xml_field(&body, "modelName");
        Ok(())
    }
}

/// Case-insensitive HTTP-style header extraction from an SSDP response.
fn header_value(response: &str, name: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// Pull a single element's text out of a UPnP description document.
fn xml_field(body: &str, element: &str) -> Option<String> {
    let re = Regex::new(&format!(r"<{element}>\s*([^<]+?)\s*</{element}>")).ok()?;
    re.captures(body).map(|caps| caps[1].to_string())
}
