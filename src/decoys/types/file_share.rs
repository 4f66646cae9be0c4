use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::decoys::credentials::{CredentialType, GeneratedCredential};
use crate::decoys::types::listener::{
    HttpRequest, HttpResponse, ListenerConfig, ListenerMode, Responder, RunningListener,
};
use crate::decoys::types::{ConnectionCallback, Decoy, DecoyType};
use crate::error::Result;

/// File-share decoy: a WebDAV-flavored HTTP index exposing a credentials
/// file and an SSH key, the classic things an intruder greps a NAS for.
pub struct FileShareDecoy {
    decoy_id: i64,
    name: String,
    bind_address: String,
    port: u16,
    credentials: Vec<GeneratedCredential>,
    password_filename: String,
    callback: Option<ConnectionCallback>,
    listener: Option<RunningListener>,
}

impl FileShareDecoy {
    pub fn new(
        decoy_id: i64,
        name: &str,
        port: u16,
        bind_address: &str,
        credentials: Vec<GeneratedCredential>,
        password_filename: &str,
    ) -> Self {
        Self {
            decoy_id,
            name: name.to_string(),
            bind_address: bind_address.to_string(),
            port,
            credentials,
            password_filename: password_filename.to_string(),
            callback: None,
            listener: None,
        }
    }

    fn responder(&self) -> Responder {
        let password_filename = self.password_filename.clone();
        let passwords: String = self
            .credentials
            .iter()
            .filter(|c| c.credential_type == CredentialType::Password)
            .map(|c| c.credential_value.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let ssh_key = self
            .credentials
            .iter()
            .find(|c| c.credential_type == CredentialType::SshKey)
            .map(|c| c.credential_value.clone());

        Arc::new(move |request: &HttpRequest| {
            let path = request.path.trim_start_matches('/');
            if path.is_empty() {
                let mut rows = format!(
                    "<tr><td><a href=\"/{0}\">{0}</a></td><td>1.2K</td></tr>",
                    password_filename
                );
                if ssh_key.is_some() {
                    rows.push_str("<tr><td><a href=\"/id_rsa\">id_rsa</a></td><td>1.7K</td></tr>");
                }
                rows.push_str(
                    "<tr><td><a href=\"/backups/\">backups/</a></td><td>-</td></tr>\
                     <tr><td><a href=\"/scans/\">scans/</a></td><td>-</td></tr>",
                );
                return HttpResponse::html(format!(
                    "<html><head><title>Index of /share</title></head>\
                     <body><h1>Index of /share</h1><table>{rows}</table></body></html>"
                ));
            }
            if path == password_filename {
                return HttpResponse::text(passwords.clone());
            }
            if path == "id_rsa" {
                if let Some(key) = &ssh_key {
                    return HttpResponse::text(key.clone());
                }
            }
            if path == "backups/" || path == "scans/" {
                return HttpResponse::html(
                    "<html><body><h1>Index</h1><p>(empty)</p></body></html>",
                );
            }
            HttpResponse::not_found()
        })
    }
}

#[async_trait]
impl Decoy for FileShareDecoy {
    fn decoy_id(&self) -> i64 {
        self.decoy_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn decoy_type(&self) -> DecoyType {
        DecoyType::FileShare
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
            server_header: Some("WebDAV/1.0".to_string()),
            credential_values,
            callback: self.callback.clone(),
        })
        .await?;

        self.port = listener.port;
        self.listener = Some(listener);
        log::info!(
            "File share decoy '{}' listening on {}:{}",
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

    async fn get(port: u16, path: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: x\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    fn password_cred(value: &str) -> GeneratedCredential {
        GeneratedCredential {
            credential_type: CredentialType::Password,
            credential_value: value.to_string(),
            planted_location: "passwords.txt".to_string(),
            canary_hostname: None,
        }
    }

    #[tokio::test]
    async fn test_serves_password_file() {
        let mut decoy = FileShareDecoy::new(
            1,
            "Share",
            0,
            "127.0.0.1",
            vec![password_cred("admin:BraveTiger42!"), password_cred("deploy:CoolRiver77#")],
            "passwords.txt",
        );
        decoy.start().await.unwrap();
        assert!(decoy.port() > 0);
        assert!(decoy.health_check().await);

        let index = get(decoy.port(), "/").await;
        assert!(index.contains("passwords.txt"));

        let passwords = get(decoy.port(), "/passwords.txt").await;
        assert!(passwords.contains("admin:BraveTiger42!"));
        assert!(passwords.contains("deploy:CoolRiver77#"));

        decoy.stop().await;
        assert!(!decoy.is_running());
    }
}
