use crate::db::queries::profiles::ServiceProfile;
use crate::decoys::types::mimic::RouteConfig;

/// Everything needed to clone one device's observable surface.
#[derive(Debug, Clone)]
pub struct MimicTemplate {
    pub source_ip: String,
    pub device_category: String,
    pub routes: Vec<RouteConfig>,
    pub server_header: Option<String>,
    pub credential_types: Vec<String>,
    pub mdns_service_type: Option<String>,
    pub mdns_name: Option<String>,
}

/// Builds mimic templates from a device's scouted service profiles.
pub struct MimicTemplateGenerator;

impl MimicTemplateGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Generate a template from all profiles of one source device.
    pub fn generate(
        &self,
        profiles: &[ServiceProfile],
        device_type: &str,
        hostname: Option<&str>,
    ) -> MimicTemplate {
        let source_ip = profiles
            .first()
            .map(|p| p.ip_address.clone())
            .unwrap_or_default();
        let device_category = categorize(device_type);

        let routes: Vec<RouteConfig> = profiles
            .iter()
            .filter(|p| p.http_status.is_some())
            .map(|p| RouteConfig {
                path: "/".to_string(),
                method: "GET".to_string(),
                status: p.http_status.unwrap_or(200),
                headers: p.http_headers.clone().unwrap_or_default(),
                body: p.http_body_snippet.clone().unwrap_or_default(),
                port: Some(p.port),
            })
            .collect();

        let server_header = profiles
            .iter()
            .find_map(|p| p.http_server_header.clone());

        MimicTemplate {
            source_ip,
            credential_types: credential_strategy(&device_category, profiles),
            mdns_service_type: Some(mdns_service_type(&device_category).to_string()),
            mdns_name: hostname.map(str::to_string),
            device_category,
            routes,
            server_header,
        }
    }
}

impl Default for MimicTemplateGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn categorize(device_type: &str) -> String {
    match device_type {
        "smart_home" | "camera" | "media" | "printer" => device_type.to_string(),
        "nas" => "nas".to_string(),
        _ => "generic".to_string(),
    }
}

/// Which credential types make sense for a clone of this device class.
fn credential_strategy(category: &str, profiles: &[ServiceProfile]) -> Vec<String> {
    match category {
        "smart_home" => vec!["ha_token".to_string(), "password".to_string()],
        "nas" => vec!["password".to_string(), "ssh_key".to_string()],
        _ => {
            let dev_port = profiles
                .iter()
                .any(|p| matches!(p.port, 3000 | 3001 | 5173 | 8000 | 8080));
            if dev_port {
                vec!["env_file".to_string(), "password".to_string()]
            } else {
                vec!["password".to_string()]
            }
        }
    }
}

fn mdns_service_type(category: &str) -> &'static str {
    match category {
        "smart_home" => "_home-assistant._tcp.local.",
        "printer" => "_ipp._tcp.local.",
        "media" => "_airplay._tcp.local.",
        _ => "_http._tcp.local.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn http_profile(port: u16, status: u16, server: Option<&str>) -> ServiceProfile {
        ServiceProfile {
            device_id: 1,
            ip_address: "192.168.1.30".to_string(),
            port,
            protocol: "tcp".to_string(),
            http_status: Some(status),
            http_headers: Some(HashMap::from([(
                "content-type".to_string(),
                "text/html".to_string(),
            )])),
            http_body_snippet: Some("<html>cam ui</html>".to_string()),
            http_server_header: server.map(str::to_string),
            scouted_at: "t".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_generate_builds_route_per_http_port() {
        let generator = MimicTemplateGenerator::new();
        let profiles = vec![
            http_profile(80, 200, Some("lighttpd/1.4.59")),
            http_profile(8443, 401, None),
            ServiceProfile {
                device_id: 1,
                ip_address: "192.168.1.30".to_string(),
                port: 554,
                protocol: "tcp".to_string(),
                protocol_version: Some("RTSP/1.0".to_string()),
                scouted_at: "t".to_string(),
                ..Default::default()
            },
        ];

        let template = generator.generate(&profiles, "camera", Some("ipcam-kitchen"));
        assert_eq!(template.device_category, "camera");
        assert_eq!(template.routes.len(), 2);
        assert_eq!(template.routes[0].port, Some(80));
        assert_eq!(template.routes[1].status, 401);
        assert_eq!(template.server_header.as_deref(), Some("lighttpd/1.4.59"));
        assert_eq!(template.mdns_name.as_deref(), Some("ipcam-kitchen"));
        assert_eq!(template.source_ip, "192.168.1.30");
    }

    #[test]
    fn test_smart_home_gets_ha_token() {
        let generator = MimicTemplateGenerator::new();
        let template = generator.generate(&[http_profile(8123, 200, None)], "smart_home", None);
        assert!(template.credential_types.contains(&"ha_token".to_string()));
        assert_eq!(
            template.mdns_service_type.as_deref(),
            Some("_home-assistant._tcp.local.")
        );
    }

    #[test]
    fn test_dev_ports_get_env_file() {
        let generator = MimicTemplateGenerator::new();
        let template = generator.generate(&[http_profile(3000, 200, None)], "computer", None);
        assert!(template.credential_types.contains(&"env_file".to_string()));
        assert_eq!(template.device_category, "generic");
    }
}
