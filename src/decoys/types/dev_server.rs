use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::decoys::credentials::{CredentialType, GeneratedCredential};
use crate::decoys::types::listener::{
    HttpRequest, HttpResponse, ListenerConfig, ListenerMode, Responder, RunningListener,
};
use crate::decoys::types::{ConnectionCallback, Decoy, DecoyType};
use crate::error::Result;

/// Development-server decoy: looks like a Vite dev server whose project
/// root leaks a `.env` file.
pub struct DevServerDecoy {
    decoy_id: i64,
    name: String,
    bind_address: String,
    port: u16,
    credentials: Vec<GeneratedCredential>,
    callback: Option<ConnectionCallback>,
    listener: Option<RunningListener>,
}

impl DevServerDecoy {
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
        let env_file = self
            .credentials
            .iter()
            .find(|c| c.credential_type == CredentialType::EnvFile)
            .map(|c| c.credential_value.clone());

        Arc::new(move |request: &HttpRequest| match request.path.as_str() {
            "/" => HttpResponse::html(
                "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"UTF-8\" />\n\
                 <title>Vite App</title>\n</head>\n<body>\n<div id=\"app\"></div>\n\
                 <script type=\"module\" src=\"/src/main.ts\"></script>\n</body>\n</html>",
            ),
            "/.env" => match &env_file {
                Some(content) => HttpResponse::text(content.clone()),
                None => HttpResponse::not_found(),
            },
            "/src/main.ts" => HttpResponse::text(
                "import { createApp } from 'vue'\nimport App from './App.vue'\n\ncreateApp(App).mount('#app')",
            )
            .with_header("Content-Type", "text/javascript"),
            "/package.json" => HttpResponse::json(
                200,
                r#"{"name":"dashboard","private":true,"scripts":{"dev":"vite","build":"vite build"}}"#,
            ),
            _ => HttpResponse::not_found(),
        })
    }
}

#[async_trait]
impl Decoy for DevServerDecoy {
    fn decoy_id(&self) -> i64 {
        self.decoy_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn decoy_type(&self) -> DecoyType {
        DecoyType::DevServer
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
            "Dev server decoy '{}' listening on {}:{}",
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

    #[tokio::test]
    async fn test_serves_env_file() {
        let env = GeneratedCredential {
            credential_type: CredentialType::EnvFile,
            credential_value: "API_KEY=sk-deadbeef\nSECRET_KEY=abc123".to_string(),
            planted_location: ".env".to_string(),
            canary_hostname: None,
        };
        let mut decoy = DevServerDecoy::new(1, "Dev Server", 0, "127.0.0.1", vec![env]);
        decoy.start().await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", decoy.port())).await.unwrap();
        stream
            .write_all(b"GET /.env HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.contains("API_KEY=sk-deadbeef"));
        decoy.stop().await;
    }
}
