use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::decoys::credentials::GeneratedCredential;
use crate::decoys::types::listener::{
    HttpRequest, HttpResponse, ListenerConfig, ListenerMode, Responder, RunningListener,
};
use crate::decoys::types::{ConnectionCallback, Decoy, DecoyType};
use crate::error::{Result, SensorError};

/// One captured HTTP route a mimic replays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_status() -> u16 {
    200
}

/// Per-port serving config for a mimic: either HTTP routes or a banner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MimicPortConfig {
    pub port: u16,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub protocol_banner: Option<String>,
}

/// A mimic decoy: one async listener per captured port, all bound to a
/// single virtual IP, replaying the scouted responses of a real device.
///
/// Privileged ports (< 1024) are not bound directly: the caller remaps
/// them to high ports and installs DNAT rules, so the listener binds on
/// `port + 10000` but reports the advertised port in connection events.
pub struct MimicDecoy {
    decoy_id: i64,
    name: String,
    bind_address: String,
    port_configs: Vec<MimicPortConfig>,
    server_header: Option<String>,
    credentials: Vec<GeneratedCredential>,
    port_remaps: HashMap<u16, u16>,
    callback: Option<ConnectionCallback>,
    endpoints: Vec<RunningListener>,
}

impl MimicDecoy {
    pub fn new(
        decoy_id: i64,
        name: &str,
        bind_address: &str,
        port_configs: Vec<MimicPortConfig>,
        server_header: Option<String>,
        credentials: Vec<GeneratedCredential>,
        port_remaps: HashMap<u16, u16>,
    ) -> Self {
        Self {
            decoy_id,
            name: name.to_string(),
            bind_address: bind_address.to_string(),
            port_configs,
            server_header,
            credentials,
            port_remaps,
            callback: None,
            endpoints: Vec::new(),
        }
    }

    pub fn port_remaps(&self) -> &HashMap<u16, u16> {
        &self.port_remaps
    }

    fn route_responder(routes: Vec<RouteConfig>) -> Responder {
        let by_path: HashMap<String, RouteConfig> = routes
            .into_iter()
            .map(|route| (route.path.clone(), route))
            .collect();

        Arc::new(move |request: &HttpRequest| {
            let route = by_path.get(&request.path).or_else(|| by_path.get("/"));
            match route {
                Some(route) => HttpResponse {
                    status: route.status,
                    headers: route
                        .headers
                        .iter()
                        .filter(|(name, _)| {
                            // Hop-by-hop and length headers are recomputed.
                            !matches!(
                                name.to_lowercase().as_str(),
                                "content-length" | "transfer-encoding" | "connection"
                            )
                        })
                        .map(|(name, value)| (name.clone(), value.clone()))
                        .collect(),
                    body: route.body.clone(),
                },
                None => HttpResponse::not_found(),
            }
        })
    }
}

#[async_trait]
impl Decoy for MimicDecoy {
    fn decoy_id(&self) -> i64 {
        self.decoy_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn decoy_type(&self) -> DecoyType {
        DecoyType::Mimic
    }

    fn bind_address(&self) -> &str {
        &self.bind_address
    }

    fn port(&self) -> u16 {
        self.port_configs.first().map(|c| c.port).unwrap_or(0)
    }

    fn is_running(&self) -> bool {
        self.endpoints.iter().any(|e| e.is_running())
    }

    fn set_connection_callback(&mut self, callback: ConnectionCallback) {
        self.callback = Some(callback);
    }

    async fn start(&mut self) -> Result<()> {
        for mut endpoint in self.endpoints.drain(..) {
            endpoint.stop();
        }

        let credential_values: HashSet<String> = self
            .credentials
            .iter()
            .map(|c| c.credential_value.clone())
            .collect();

        for config in &self.port_configs {
            let advertised_port = config.port;
            let bind_port = self
                .port_remaps
                .get(&advertised_port)
                .copied()
                .unwrap_or(advertised_port);

            let mode = if !config.routes.is_empty() {
                ListenerMode::Http(Self::route_responder(config.routes.clone()))
            } else {
                ListenerMode::Banner(config.protocol_banner.clone().unwrap_or_default())
            };

            let result = RunningListener::start(ListenerConfig {
                bind_address: self.bind_address.clone(),
                bind_port,
                advertised_port: Some(advertised_port),
                mode,
                server_header: self.server_header.clone(),
                credential_values: credential_values.clone(),
                callback: self.callback.clone(),
            })
            .await;

            match result {
                Ok(listener) => {
                    if bind_port != advertised_port {
                        log::debug!(
                            "Mimic endpoint on {}:{bind_port} (remapped from :{advertised_port})",
                            self.bind_address
                        );
                    }
                    self.endpoints.push(listener);
                }
                Err(e) => {
                    log::warn!(
                        "Failed to start mimic endpoint {}:{advertised_port} (bind :{bind_port}): {e}",
                        self.bind_address
                    );
                }
            }
        }

        if self.endpoints.is_empty() && !self.port_configs.is_empty() {
            return Err(SensorError::Decoy(format!(
                "mimic '{}' started no endpoints",
                self.name
            )));
        }

        log::info!(
            "Mimic decoy '{}' started on {} with {}/{} endpoints",
            self.name,
            self.bind_address,
            self.endpoints.len(),
            self.port_configs.len()
        );
        Ok(())
    }

    async fn stop(&mut self) {
        for mut endpoint in self.endpoints.drain(..) {
            endpoint.stop();
        }
        log::info!("Mimic decoy '{}' stopped", self.name);
    }

    async fn health_check(&self) -> bool {
        self.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(port: u16, path: &str, extra_header: Option<&str>) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let header = extra_header.map(|h| format!("{h}\r\n")).unwrap_or_default();
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: x\r\n{header}\r\n").as_bytes())
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    fn http_config(port: u16, body: &str) -> MimicPortConfig {
        MimicPortConfig {
            port,
            routes: vec![RouteConfig {
                path: "/".to_string(),
                method: "GET".to_string(),
                status: 200,
                headers: HashMap::from([(
                    "Content-Type".to_string(),
                    "text/html".to_string(),
                )]),
                body: body.to_string(),
                port: Some(port),
            }],
            protocol_banner: None,
        }
    }

    #[tokio::test]
    async fn test_replays_captured_route() {
        let mut mimic = MimicDecoy::new(
            1,
            "Mimic: hub",
            "127.0.0.1",
            vec![http_config(0, "<html>captured body</html>")],
            Some("lighttpd/1.4.59".to_string()),
            Vec::new(),
            HashMap::new(),
        );
        mimic.start().await.unwrap();
        let bound = mimic.endpoints[0].port;

        let response = get(bound, "/", None).await;
        assert!(response.contains("captured body"));
        assert!(response.contains("Server: lighttpd/1.4.59"));
        mimic.stop().await;
    }

    #[tokio::test]
    async fn test_banner_endpoint() {
        let mut mimic = MimicDecoy::new(
            1,
            "Mimic: nas",
            "127.0.0.1",
            vec![MimicPortConfig {
                port: 0,
                routes: Vec::new(),
                protocol_banner: Some("220 ProFTPD Server ready.".to_string()),
            }],
            None,
            Vec::new(),
            HashMap::new(),
        );
        mimic.start().await.unwrap();
        let bound = mimic.endpoints[0].port;

        let mut stream = TcpStream::connect(("127.0.0.1", bound)).await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("220 ProFTPD"));
        mimic.stop().await;
    }

    #[tokio::test]
    async fn test_credential_detection_reports_advertised_port() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();

        let mut mimic = MimicDecoy::new(
            1,
            "Mimic: cam",
            "127.0.0.1",
            vec![http_config(8443, "<html>login</html>")],
            None,
            vec![GeneratedCredential {
                credential_type: crate::decoys::credentials::CredentialType::AwsKey,
                credential_value: "AKIAXYZ12345EXAMPLE".to_string(),
                planted_location: "passwords.txt".to_string(),
                canary_hostname: None,
            }],
            HashMap::from([(8443u16, 0u16)]),
        );
        mimic.set_connection_callback(Arc::new(move |event| {
            events_clone.lock().unwrap().push(event);
        }));
        mimic.start().await.unwrap();
        let bound = mimic.endpoints[0].port;

        get(bound, "/", Some("X-Api-Key: AKIAXYZ12345EXAMPLE")).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let captured = events.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].dest_port, 8443);
        assert_eq!(
            captured[0].credential_used.as_deref(),
            Some("AKIAXYZ12345EXAMPLE")
        );
        drop(captured);
        mimic.stop().await;
    }

    #[test]
    fn test_route_config_defaults_from_json() {
        let route: RouteConfig = serde_json::from_str(r#"{"body": "hi"}"#).unwrap();
        assert_eq!(route.path, "/");
        assert_eq!(route.method, "GET");
        assert_eq!(route.status, 200);
        assert!(route.headers.is_empty());
    }
}
