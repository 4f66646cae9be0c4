use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Result, SensorError};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const WS_TIMEOUT: Duration = Duration::from_secs(15);

/// A device from the HA device registry, reduced to what enrichment needs.
#[derive(Debug, Clone, PartialEq)]
pub struct HaDevice {
    pub id: String,
    pub name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub area_id: Option<String>,
    /// MAC addresses from `connections`, lowercased.
    pub mac_addresses: Vec<String>,
}

/// An area from the HA area registry.
#[derive(Debug, Clone, PartialEq)]
pub struct HaArea {
    pub id: String,
    pub name: String,
}

/// Client for a Home Assistant instance: REST for the connectivity check,
/// WebSocket for the device and area registries.
pub struct HomeAssistantClient {
    url: String,
    token: String,
    http: reqwest::Client,
}

impl HomeAssistantClient {
    pub fn new(url: &str, token: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("reqwest client"),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// `GET {url}/api/`; expects 200 and `{"message": "API running."}`.
    pub async fn check_connectivity(&self) -> Result<()> {
        let response = self
            .http
            .get(format!("{}/api/", self.url))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SensorError::HomeAssistant(format!(
                "connectivity check returned {}",
                response.status()
            )));
        }
        let body: Value = response.json().await?;
        if body["message"].as_str() != Some("API running.") {
            return Err(SensorError::HomeAssistant(
                "unexpected connectivity response".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn get_devices(&self) -> Result<Vec<HaDevice>> {
        let result = self.ws_command("config/device_registry/list").await?;
        let entries = result
            .as_array()
            .ok_or_else(|| SensorError::HomeAssistant("device registry is not a list".to_string()))?;
        Ok(entries.iter().map(parse_device).collect())
    }

    pub async fn get_areas(&self) -> Result<Vec<HaArea>> {
        let result = self.ws_command("config/area_registry/list").await?;
        let entries = result
            .as_array()
            .ok_or_else(|| SensorError::HomeAssistant("area registry is not a list".to_string()))?;
        Ok(entries.iter().filter_map(parse_area).collect())
    }

    /// Run one authenticated WebSocket command and return its result.
    async fn ws_command(&self, command: &str) -> Result<Value> {
        let ws_url = websocket_url(&self.url);
        let connect = tokio::time::timeout(WS_TIMEOUT, tokio_tungstenite::connect_async(&ws_url))
            .await
            .map_err(|_| SensorError::HomeAssistant("websocket connect timed out".to_string()))?
            .map_err(|e| SensorError::HomeAssistant(format!("websocket connect: {e}")))?;
        let (mut stream, _) = connect;

        // auth_required -> auth -> auth_ok
        let first = read_json(&mut stream).await?;
        if first["type"].as_str() != Some("auth_required") {
            return Err(SensorError::HomeAssistant(format!(
                "expected auth_required, got {}",
                first["type"]
            )));
        }
        stream
            .send(Message::Text(
                json!({"type": "auth", "access_token": self.token}).to_string(),
            ))
            .await
            .map_err(|e| SensorError::HomeAssistant(format!("websocket send: {e}")))?;

        let auth = read_json(&mut stream).await?;
        match auth["type"].as_str() {
            Some("auth_ok") => {}
            Some("auth_invalid") => {
                return Err(SensorError::HomeAssistant("authentication rejected".to_string()))
            }
            other => {
                return Err(SensorError::HomeAssistant(format!(
                    "unexpected auth response: {other:?}"
                )))
            }
        }

        stream
            .send(Message::Text(json!({"id": 1, "type": command}).to_string()))
            .await
            .map_err(|e| SensorError::HomeAssistant(format!("websocket send: {e}")))?;

        // Read until the matching result frame; HA may interleave others.
        loop {
            let message = read_json(&mut stream).await?;
            if message["id"].as_i64() == Some(1) && message["type"].as_str() == Some("result") {
                if message["success"].as_bool() == Some(false) {
                    return Err(SensorError::HomeAssistant(format!(
                        "command {command} failed: {}",
                        message["error"]
                    )));
                }
                return Ok(message["result"].clone());
            }
        }
    }
}

async fn read_json(
    stream: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Result<Value> {
    loop {
        let frame = tokio::time::timeout(WS_TIMEOUT, stream.next())
            .await
            .map_err(|_| SensorError::HomeAssistant("websocket read timed out".to_string()))?
            .ok_or_else(|| SensorError::HomeAssistant("websocket closed".to_string()))?
            .map_err(|e| SensorError::HomeAssistant(format!("websocket read: {e}")))?;
        match frame {
            Message::Text(text) => {
                return serde_json::from_str(&text)
                    .map_err(|e| SensorError::HomeAssistant(format!("invalid frame: {e}")));
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                return Err(SensorError::HomeAssistant("websocket closed".to_string()))
            }
            _ => continue,
        }
    }
}

/// `http(s)://host` -> `ws(s)://host/api/websocket`.
fn websocket_url(base: &str) -> String {
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base}")
    };
    format!("{}/api/websocket", ws_base.trim_end_matches('/'))
}

/// Parse a device registry entry. `connections` is a list of
/// `[type, value]` pairs; only `mac` entries are kept, lowercased.
fn parse_device(entry: &Value) -> HaDevice {
    let mac_addresses = entry["connections"]
        .as_array()
        .map(|connections| {
            connections
                .iter()
                .filter_map(|pair| {
                    let pair = pair.as_array()?;
                    if pair.first()?.as_str()? == "mac" {
                        Some(pair.get(1)?.as_str()?.to_lowercase())
                    } else {
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let name = entry["name_by_user"]
        .as_str()
        .or_else(|| entry["name"].as_str())
        .map(str::to_string);

    HaDevice {
        id: entry["id"].as_str().unwrap_or_default().to_string(),
        name,
        manufacturer: entry["manufacturer"].as_str().map(str::to_string),
        model: entry["model"].as_str().map(str::to_string),
        area_id: entry["area_id"].as_str().map(str::to_string),
        mac_addresses,
    }
}

fn parse_area(entry: &Value) -> Option<HaArea> {
    Some(HaArea {
        id: entry["area_id"].as_str()?.to_string(),
        name: entry["name"].as_str()?.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url() {
        assert_eq!(
            websocket_url("http://homeassistant.local:8123"),
            "ws://homeassistant.local:8123/api/websocket"
        );
        assert_eq!(
            websocket_url("https://ha.example.com"),
            "wss://ha.example.com/api/websocket"
        );
    }

    #[test]
    fn test_parse_device_extracts_macs() {
        let entry = json!({
            "id": "abc123",
            "name": "Living Room Speaker",
            "name_by_user": null,
            "manufacturer": "Sonos",
            "model": "One SL",
            "area_id": "living_room",
            "connections": [
                ["mac", "A4:83:E7:11:22:33"],
                ["upnp", "uuid:whatever"],
                ["mac", "b8:27:eb:00:11:22"]
            ]
        });
        let device = parse_device(&entry);
        assert_eq!(device.name.as_deref(), Some("Living Room Speaker"));
        assert_eq!(
            device.mac_addresses,
            vec!["a4:83:e7:11:22:33".to_string(), "b8:27:eb:00:11:22".to_string()]
        );
        assert_eq!(device.area_id.as_deref(), Some("living_room"));
    }

    #[test]
    fn test_parse_device_prefers_user_name() {
        let entry = json!({
            "id": "abc",
            "name": "Shelly Plug S",
            "name_by_user": "Coffee Machine",
            "connections": []
        });
        let device = parse_device(&entry);
        assert_eq!(device.name.as_deref(), Some("Coffee Machine"));
    }

    #[test]
    fn test_parse_device_tolerates_missing_fields() {
        let device = parse_device(&json!({"id": "x"}));
        assert!(device.name.is_none());
        assert!(device.mac_addresses.is_empty());
        assert!(device.manufacturer.is_none());
    }

    #[test]
    fn test_parse_area() {
        let area = parse_area(&json!({"area_id": "kitchen", "name": "Kitchen"})).unwrap();
        assert_eq!(area.id, "kitchen");
        assert_eq!(area.name, "Kitchen");
        assert!(parse_area(&json!({"name": "No Id"})).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_error() {
        let client = HomeAssistantClient::new("http://127.0.0.1:1", "token");
        assert!(client.check_connectivity().await.is_err());
        assert!(client.get_devices().await.is_err());
    }
}
