use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::devices::signatures::{ClassificationSource, DeviceClassification};
use crate::error::{Result, SensorError};
use crate::fingerprint::composite::CompositeFingerprint;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Device classifier backed by any OpenAI-compatible chat completion
/// endpoint (local llama.cpp/LM Studio servers or cloud APIs).
pub struct OpenAiCompatibleClassifier {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct LlmReply {
    manufacturer: Option<String>,
    device_type: Option<String>,
    model: Option<String>,
    confidence: Option<f64>,
}

impl OpenAiCompatibleClassifier {
    pub fn new(endpoint: &str, model: &str, api_key: Option<&str>) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.map(str::to_string),
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client"),
        }
    }

    /// Ask the LLM to classify a fingerprint.
    ///
    /// A response missing `manufacturer` or `device_type` is a malformed
    /// response and surfaces as an error; the caller falls back to the
    /// local result. Missing `model` maps to None, missing `confidence`
    /// to 0.5.
    pub async fn classify(&self, fp: &CompositeFingerprint) -> Result<DeviceClassification> {
        let url = format!("{}/chat/completions", self.endpoint);
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": build_user_prompt(fp)}],
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?.error_for_status()?;
        let chat: ChatResponse = response.json().await?;
        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| SensorError::Classifier("empty choices in LLM response".to_string()))?;

        parse_llm_reply(content)
    }
}

/// Render the fingerprint signals as a classification prompt.
fn build_user_prompt(fp: &CompositeFingerprint) -> String {
    let mut lines = vec![
        "Identify this network device from its fingerprint signals.".to_string(),
        "Reply with a single JSON object with keys: manufacturer, device_type, model, confidence."
            .to_string(),
        String::new(),
    ];
    if let Some(mac) = &fp.mac_address {
        lines.push(format!("MAC address: {mac}"));
    }
    if let Some(hostname) = &fp.mdns_hostname {
        lines.push(format!("mDNS hostname: {hostname}"));
    }
    if let Some(hash) = &fp.dhcp_fingerprint_hash {
        lines.push(format!("DHCP fingerprint hash: {hash}"));
    }
    if let Some(hash) = &fp.open_ports_hash {
        lines.push(format!("Open ports hash: {hash}"));
    }
    if let Some(hash) = &fp.connection_pattern_hash {
        lines.push(format!("Connection pattern hash: {hash}"));
    }
    lines.join("\n")
}

/// Parse the model's reply, tolerating `<think>` prefixes and fenced code
/// blocks around the JSON.
fn parse_llm_reply(content: &str) -> Result<DeviceClassification> {
    let cleaned = strip_code_fences(strip_think_blocks(content));

    let reply: LlmReply = serde_json::from_str(cleaned.trim())
        .map_err(|e| SensorError::Classifier(format!("unparseable LLM response: {e}")))?;

    let manufacturer = reply.manufacturer.filter(|m| !m.is_empty()).ok_or_else(|| {
        SensorError::Classifier("LLM response missing manufacturer".to_string())
    })?;
    let device_type = reply.device_type.filter(|t| !t.is_empty()).ok_or_else(|| {
        SensorError::Classifier("LLM response missing device_type".to_string())
    })?;

    Ok(DeviceClassification {
        manufacturer,
        device_type,
        model: reply.model,
        confidence: reply.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        source: ClassificationSource::Llm,
    })
}

/// Remove reasoning-model `<think>...</think>` blocks.
fn strip_think_blocks(content: &str) -> &str {
    let trimmed = content.trim_start();
    if let Some(rest) = trimmed.strip_prefix("<think>") {
        if let Some(end) = rest.find("</think>") {
            return rest[end + "</think>".len()..].trim_start();
        }
    }
    content
}

/// Remove a surrounding ``` or ```json fence.
fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    inner.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let reply = parse_llm_reply(
            r#"{"manufacturer": "Apple", "device_type": "smartphone", "model": "iPhone 15", "confidence": 0.92}"#,
        )
        .unwrap();
        assert_eq!(reply.manufacturer, "Apple");
        assert_eq!(reply.device_type, "smartphone");
        assert_eq!(reply.model.as_deref(), Some("iPhone 15"));
        assert!((reply.confidence - 0.92).abs() < 1e-9);
        assert_eq!(reply.source, ClassificationSource::Llm);
    }

    #[test]
    fn test_parse_fenced_json() {
        let reply = parse_llm_reply(
            "```json\n{\"manufacturer\": \"Sonos\", \"device_type\": \"media\"}\n```",
        )
        .unwrap();
        assert_eq!(reply.manufacturer, "Sonos");
        // Missing model -> None, missing confidence -> 0.5
        assert!(reply.model.is_none());
        assert!((reply.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_think_prefix() {
        let content = "<think>The MAC prefix looks like Espressif, probably an IoT device.</think>\n{\"manufacturer\": \"Espressif\", \"device_type\": \"iot\"}";
        let reply = parse_llm_reply(content).unwrap();
        assert_eq!(reply.manufacturer, "Espressif");
        assert_eq!(reply.device_type, "iot");
    }

    #[test]
    fn test_missing_manufacturer_is_error() {
        let err = parse_llm_reply(r#"{"device_type": "iot"}"#).unwrap_err();
        assert!(err.to_string().contains("manufacturer"));
    }

    #[test]
    fn test_missing_device_type_is_error() {
        let err = parse_llm_reply(r#"{"manufacturer": "Apple"}"#).unwrap_err();
        assert!(err.to_string().contains("device_type"));
    }

    #[test]
    fn test_garbage_is_error() {
        assert!(parse_llm_reply("I think it's probably an iPhone?").is_err());
    }

    #[test]
    fn test_confidence_clamped() {
        let reply = parse_llm_reply(
            r#"{"manufacturer": "Apple", "device_type": "phone", "confidence": 7.5}"#,
        )
        .unwrap();
        assert_eq!(reply.confidence, 1.0);
    }

    #[test]
    fn test_prompt_includes_signals() {
        let fp = crate::fingerprint::composite::compute_fingerprint(
            Some("A4:83:E7:11:22:33"),
            Some("sarahs-iphone"),
            None,
            None,
            Some(&[80, 443]),
        );
        let prompt = build_user_prompt(&fp);
        assert!(prompt.contains("A4:83:E7:11:22:33"));
        assert!(prompt.contains("sarahs-iphone"));
        assert!(prompt.contains("JSON"));
    }
}
