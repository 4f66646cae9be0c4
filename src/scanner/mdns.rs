use std::collections::{HashMap, HashSet};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::time::timeout;

use crate::error::{Result, SensorError};
use crate::fingerprint::composite::normalize_mdns_hostname;

/// Service types browsed during Phase 3 enrichment. Covers the device
/// classes a home network actually advertises.
const SERVICE_TYPES: &[&str] = &[
    "_http._tcp.local.",
    "_home-assistant._tcp.local.",
    "_hap._tcp.local.",
    "_airplay._tcp.local.",
    "_googlecast._tcp.local.",
    "_ipp._tcp.local.",
    "_printer._tcp.local.",
    "_smb._tcp.local.",
    "_spotify-connect._tcp.local.",
    "_workstation._tcp.local.",
];

/// One mDNS discovery hit.
#[derive(Debug, Clone)]
pub struct MdnsRecord {
    pub ip: String,
    pub hostname: String,
    pub service_type: String,
}

/// Browses a fixed set of mDNS service types for a bounded window.
pub struct MdnsBrowser {
    browse_window: Duration,
}

impl Default for MdnsBrowser {
    fn default() -> Self {
        Self {
            browse_window: Duration::from_secs(4),
        }
    }
}

impl MdnsBrowser {
    pub fn new(browse_window: Duration) -> Self {
        Self { browse_window }
    }

    /// Browse all service types and collect resolved records. One record
    /// per (ip, service_type); the hostname is normalized for fingerprint
    /// comparison.
    pub async fn browse(&self) -> Result<Vec<MdnsRecord>> {
        let daemon =
            ServiceDaemon::new().map_err(|e| SensorError::Privileged(format!("mdns: {e}")))?;

        let mut receivers = Vec::new();
        for service_type in SERVICE_TYPES {
            match daemon.browse(service_type) {
                Ok(rx) => receivers.push((service_type.to_string(), rx)),
                Err(e) => log::debug!("mDNS browse failed for {service_type}: {e}"),
            }
        }

        let mut seen: HashMap<(String, String), MdnsRecord> = HashMap::new();
        let deadline = tokio::time::Instant::now() + self.browse_window;

        for (service_type, rx) in &receivers {
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match timeout(remaining, rx.recv_async()).await {
                    Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                        let hostname = normalize_mdns_hostname(info.get_hostname());
                        for addr in info.get_addresses() {
                            let ip = addr.to_string();
                            seen.entry((ip.clone(), service_type.clone())).or_insert(
                                MdnsRecord {
                                    ip,
                                    hostname: hostname.clone(),
                                    service_type: service_type.clone(),
                                },
                            );
                        }
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(_)) | Err(_) => break,
                }
            }
        }

        for service_type in SERVICE_TYPES {
            let _ = daemon.stop_browse(service_type);
        }
        let _ = daemon.shutdown();

        Ok(seen.into_values().collect())
    }

    /// Distinct service types present in a record set.
    pub fn service_types(records: &[MdnsRecord]) -> HashSet<String> {
        records
            .iter()
            .map(|r| {
                r.service_type
                    .trim_end_matches(".local.")
                    .trim_end_matches('.')
                    .to_string()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_types_strips_local_suffix() {
        let records = vec![
            MdnsRecord {
                ip: "192.168.1.5".to_string(),
                hostname: "hub".to_string(),
                service_type: "_home-assistant._tcp.local.".to_string(),
            },
            MdnsRecord {
                ip: "192.168.1.6".to_string(),
                hostname: "printer".to_string(),
                service_type: "_ipp._tcp.local.".to_string(),
            },
        ];
        let types = MdnsBrowser::service_types(&records);
        assert!(types.contains("_home-assistant._tcp"));
        assert!(types.contains("_ipp._tcp"));
    }
}
