use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::decoys::credentials::{CredentialType, GeneratedCredential};
use crate::decoys::types::listener::{
    HttpRequest, HttpResponse, ListenerConfig, ListenerMode, Responder, RunningListener,
};
use crate::decoys::types::{ConnectionCallback, Decoy, DecoyType};
use crate::error::Result;

/// Home Assistant decoy: serves the HA frontend shell and an `/api/`
/// surface that accepts the planted long-lived access token.
pub struct HomeAssistantDecoy {
    decoy_id: i64,
    name: String,
    bind_address: String,
    port: u16,
    credentials: Vec<GeneratedCredential>,
    callback: Option<ConnectionCallback>,
    listener: Option<RunningListener>,
}

impl HomeAssistantDecoy {
    pub fn new(
        decoy_id: i64,
        name: &str,
        port: u16,
        bind_address: &str,
        credentials: Vec<GeneratedCredential>,
    ) -> Self {
        Self {
            decoy_id,
            name: name.to_string(),
            bind_address: bind_address.to_string(),
            port,
            credentials,
            callback: None,
            listener: None,
        }
    }

    fn responder(&self) -> Responder {
        let ha_token = self
            .credentials
            .iter()
            .find(|c| c.credential_type == CredentialType::HaToken)
            .map(|c| c.credential_value.clone());

        Arc::new(move |request: &HttpRequest| {
            let path = request.path.as_str();
            if path == "/" || path == "/lovelace" {
                return HttpResponse::html(
                    "<!DOCTYPE html><html><head><title>Home Assistant</title></head>\
                     <body><home-assistant></home-assistant>\
                     <script src=\"/frontend_latest/core.js\"></script></body></html>",
                );
            }
            if path == "/api/" {
                return HttpResponse::json(200, r#"{"message": "API running."}"#);
            }
            if path.starts_with("/api/") {
                let authorized = ha_token.as_ref().is_some_and(|token| {
                    request
                        .headers
                        .get("authorization")
                        .is_some_and(|auth| auth.contains(token.as_str()))
                });
                return if authorized {
                    HttpResponse::json(200, r#"{"result": "ok"}"#)
                } else {
                    HttpResponse::json(401, r#"{"message": "Invalid authentication."}"#)
                };
            }
            if path == "/auth/providers" {
                return HttpResponse::json(
                    200,
                    r#"[{"name": "Home Assistant Local", "id": null, "type": "homeassistant"}]"#,
                );
            }
            HttpResponse::not_found().with_status(404)
        })
    }
}

#[async_trait]
impl Decoy for HomeAssistantDecoy {
    fn decoy_id(&self) -> i64 {
        self.decoy_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn decoy_type(&self) -> DecoyType {
        DecoyType::HomeAssistant
    }

    fn bind_address(&self) -> &str {
        &self.bind_address
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn is_running(&self) -> bool {
        self.listener.as_ref().is_some_and(|l| l.is_running())
    }

    fn set_connection_callback(&mut self, callback: ConnectionCallback) {
        self.callback = Some(callback);
    }

    async fn start(&mut self) -> Result<()> {
        if let Some(mut old) = self.listener.take() {
            old.stop();
        }
        let credential_values: HashSet<String> = self
            .credentials
            .iter()
            .map(|c| c.credential_value.clone())
            .collect();

        let listener = RunningListener::start(ListenerConfig {
            bind_address: self.bind_address.clone(),
            bind_port: self.port,
            advertised_port: None,
            mode: ListenerMode::Http(self.responder()),
            server_header: None,
            credential_values,
            callback: self.callback.clone(),
        })
        .await?;

        self.port = listener.port;
        self.listener = Some(listener);
        log::info!(
            "Home Assistant decoy '{}' listening on {}:{}",
            self.name,
            self.bind_address,
            self.port
        );
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
    }

    async fn health_check(&self) -> bool {
        self.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn request(port: u16, raw: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    fn token_cred(value: &str) -> GeneratedCredential {
        GeneratedCredential {
            credential_type: CredentialType::HaToken,
            credential_value: value.to_string(),
            planted_location: "ha_config".to_string(),
            canary_hostname: None,
        }
    }

    #[tokio::test]
    async fn test_api_root_answers_like_ha() {
        let mut decoy =
            HomeAssistantDecoy::new(1, "Smart Home", 0, "127.0.0.1", vec![token_cred("tok-abc")]);
        decoy.start().await.unwrap();

        let response = request(
            decoy.port(),
            "GET /api/ HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .await;
        assert!(response.contains(r#"{"message": "API running."}"#));
        decoy.stop().await;
    }

    #[tokio::test]
    async fn test_api_states_requires_planted_token() {
        let mut decoy =
            HomeAssistantDecoy::new(1, "Smart Home", 0, "127.0.0.1", vec![token_cred("tok-abc")]);
        decoy.start().await.unwrap();

        let denied = request(
            decoy.port(),
            "GET /api/states HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .await;
        assert!(denied.starts_with("HTTP/1.1 401"));

        let allowed = request(
            decoy.port(),
            "GET /api/states HTTP/1.1\r\nHost: x\r\nAuthorization: Bearer tok-abc\r\n\r\n",
        )
        .await;
        assert!(allowed.starts_with("HTTP/1.1 200"));
        decoy.stop().await;
    }
}
