use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use mdns_sd::{ServiceDaemon, ServiceInfo};

use crate::error::{Result, SensorError};

/// Hostname bases per device category. A mimic should advertise a name an
/// intruder would expect from the device class it clones.
fn hostname_base(category: &str) -> &'static str {
    match category {
        "camera" => "ipcam",
        "smart_home" => "hub",
        "printer" => "printer",
        "media" => "media",
        "nas" => "nas",
        _ => "device",
    }
}

/// Generate the mDNS hostname for a mimic, e.g. `ipcam-203.local.`.
/// A scouted source name wins over the category default.
pub fn generate_mimic_hostname(
    mdns_name: Option<&str>,
    device_category: &str,
    virtual_ip: &str,
) -> String {
    let base = mdns_name
        .map(|name| {
            name.trim_end_matches('.')
                .trim_end_matches(".local")
                .to_lowercase()
                .replace(' ', "-")
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| hostname_base(device_category).to_string());

    let suffix = virtual_ip
        .rsplit('.')
        .next()
        .unwrap_or("0")
        .to_string();
    format!("{base}-{suffix}.local.")
}

/// Advertises mimic hostnames over mDNS so clones appear in network
/// browsers the way their source devices do.
pub struct MimicMdnsAdvertiser {
    daemon: Mutex<Option<ServiceDaemon>>,
    registered: Mutex<HashMap<i64, String>>,
}

impl MimicMdnsAdvertiser {
    pub fn new() -> Self {
        Self {
            daemon: Mutex::new(None),
            registered: Mutex::new(HashMap::new()),
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut daemon = self.daemon.lock().unwrap();
        if daemon.is_none() {
            *daemon =
                Some(ServiceDaemon::new().map_err(|e| SensorError::Privileged(format!("mdns: {e}")))?);
        }
        Ok(())
    }

    pub fn stop(&self) {
        let mut registered = self.registered.lock().unwrap();
        let daemon = self.daemon.lock().unwrap();
        if let Some(daemon) = daemon.as_ref() {
            for fullname in registered.values() {
                let _ = daemon.unregister(fullname);
            }
            let _ = daemon.shutdown();
        }
        registered.clear();
    }

    /// Register a mimic's service. `hostname` carries the `.local.`
    /// suffix; the instance name is derived from it.
    pub fn register(
        &self,
        decoy_id: i64,
        virtual_ip: &str,
        port: u16,
        service_type: &str,
        hostname: &str,
    ) -> Result<()> {
        let daemon = self.daemon.lock().unwrap();
        let Some(daemon) = daemon.as_ref() else {
            return Err(SensorError::Privileged("mdns advertiser not started".to_string()));
        };

        let ip: Ipv4Addr = virtual_ip
            .parse()
            .map_err(|_| SensorError::Privileged(format!("invalid mimic IP {virtual_ip}")))?;
        let instance = hostname.trim_end_matches('.').trim_end_matches(".local");

        let properties: Option<HashMap<String, String>> = None;
        let info = ServiceInfo::new(service_type, instance, hostname, std::net::IpAddr::V4(ip), port, properties)
            .map_err(|e| SensorError::Privileged(format!("mdns service info: {e}")))?;
        let fullname = info.get_fullname().to_string();
        daemon
            .register(info)
            .map_err(|e| SensorError::Privileged(format!("mdns register: {e}")))?;

        self.registered.lock().unwrap().insert(decoy_id, fullname);
        log::info!("mDNS registered '{hostname}' for mimic {decoy_id} at {virtual_ip}:{port}");
        Ok(())
    }

    pub fn unregister(&self, decoy_id: i64) {
        let fullname = self.registered.lock().unwrap().remove(&decoy_id);
        if let (Some(fullname), Some(daemon)) = (fullname, self.daemon.lock().unwrap().as_ref()) {
            let _ = daemon.unregister(&fullname);
        }
    }
}

impl Default for MimicMdnsAdvertiser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_uses_source_name() {
        let hostname = generate_mimic_hostname(Some("Kitchen Cam"), "camera", "192.168.1.203");
        assert_eq!(hostname, "kitchen-cam-203.local.");
    }

    #[test]
    fn test_hostname_falls_back_to_category() {
        assert_eq!(
            generate_mimic_hostname(None, "camera", "192.168.1.207"),
            "ipcam-207.local."
        );
        assert_eq!(
            generate_mimic_hostname(None, "smart_home", "192.168.1.210"),
            "hub-210.local."
        );
        assert_eq!(
            generate_mimic_hostname(None, "unknown-kind", "192.168.1.211"),
            "device-211.local."
        );
    }

    #[test]
    fn test_hostname_strips_local_suffix_from_source() {
        assert_eq!(
            generate_mimic_hostname(Some("ipcam.local."), "camera", "192.168.1.203"),
            "ipcam-203.local."
        );
    }
}
