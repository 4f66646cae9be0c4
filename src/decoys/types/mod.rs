pub mod dev_server;
pub mod file_share;
pub mod home_assistant;
mod listener;
pub mod mimic;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::decoys::credentials::GeneratedCredential;
use crate::error::Result;

/// A connection observed by a decoy listener.
#[derive(Debug, Clone)]
pub struct DecoyConnectionEvent {
    pub source_ip: String,
    pub source_port: u16,
    pub dest_port: u16,
    pub protocol: String,
    pub timestamp: DateTime<Utc>,
    pub request_path: Option<String>,
    /// Planted credential value found in the request, if any.
    pub credential_used: Option<String>,
}

/// Callback invoked synchronously from a decoy's connection handler.
/// Implementations publish events fire-and-forget.
pub type ConnectionCallback = Arc<dyn Fn(DecoyConnectionEvent) + Send + Sync>;

/// The closed set of decoy type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoyType {
    FileShare,
    DevServer,
    HomeAssistant,
    Mimic,
}

impl DecoyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecoyType::FileShare => "file_share",
            DecoyType::DevServer => "dev_server",
            DecoyType::HomeAssistant => "home_assistant",
            DecoyType::Mimic => "mimic",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "file_share" => Some(DecoyType::FileShare),
            "dev_server" => Some(DecoyType::DevServer),
            "home_assistant" => Some(DecoyType::HomeAssistant),
            "mimic" => Some(DecoyType::Mimic),
            _ => None,
        }
    }

    /// Display name used when auto-deploying.
    pub fn display_name(&self) -> &'static str {
        match self {
            DecoyType::FileShare => "Network Share",
            DecoyType::DevServer => "Dev Server",
            DecoyType::HomeAssistant => "Smart Home",
            DecoyType::Mimic => "Mimic",
        }
    }
}

/// Contract every decoy implements. Listeners bind on `start` (an OS port
/// is assigned when the configured port is 0), serve plausible content,
/// and report connections through the registered callback.
#[async_trait]
pub trait Decoy: Send + Sync {
    fn decoy_id(&self) -> i64;
    fn name(&self) -> &str;
    fn decoy_type(&self) -> DecoyType;
    fn bind_address(&self) -> &str;
    /// Bound port; 0 until started when the configured port was 0.
    fn port(&self) -> u16;
    fn is_running(&self) -> bool;
    fn set_connection_callback(&mut self, callback: ConnectionCallback);

    async fn start(&mut self) -> Result<()>;
    async fn stop(&mut self);
    async fn health_check(&self) -> bool;
}

/// Factory mapping a decoy type tag to its constructor.
pub fn create_decoy(
    decoy_type: DecoyType,
    decoy_id: i64,
    name: &str,
    port: u16,
    bind_address: &str,
    credentials: Vec<GeneratedCredential>,
    config: &serde_json::Value,
) -> Box<dyn Decoy> {
    match decoy_type {
        DecoyType::DevServer => Box::new(dev_server::DevServerDecoy::new(
            decoy_id,
            name,
            port,
            bind_address,
            credentials,
        )),
        DecoyType::HomeAssistant => Box::new(home_assistant::HomeAssistantDecoy::new(
            decoy_id,
            name,
            port,
            bind_address,
            credentials,
        )),
        // Mimics are built by the mimic orchestrator with a full template;
        // the factory fallback treats the tag as a file share.
        DecoyType::FileShare | DecoyType::Mimic => Box::new(file_share::FileShareDecoy::new(
            decoy_id,
            name,
            port,
            bind_address,
            credentials,
            config["password_filename"].as_str().unwrap_or("passwords.txt"),
        )),
    }
}
