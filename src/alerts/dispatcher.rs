use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use crate::alerts::Severity;
use crate::config::AlertConfig;
use crate::events::{types, EventBus};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Async delivery handler for one channel.
pub type AlertHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static>;

/// One configured delivery channel with its severity gate.
pub struct Channel {
    pub name: String,
    pub min_severity: Severity,
    handler: AlertHandler,
}

impl Channel {
    pub fn new(name: &str, min_severity: Severity, handler: AlertHandler) -> Self {
        Self {
            name: name.to_string(),
            min_severity,
            handler,
        }
    }

    fn accepts(&self, severity: Severity) -> bool {
        severity >= self.min_severity
    }
}

/// Fans alerts out to configured channels. Delivery is best-effort: a
/// failing channel is logged and never blocks the others.
pub struct AlertDispatcher {
    channels: Vec<Channel>,
}

impl AlertDispatcher {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self { channels }
    }

    /// Build the dispatcher from alert configuration: Slack webhook,
    /// structured JSON log, and push relay, each with its own threshold.
    pub fn from_config(config: &AlertConfig) -> Self {
        let mut channels = Vec::new();

        if let Some(webhook_url) = &config.slack_webhook_url {
            let min = Severity::from_str(&config.slack_min_severity).unwrap_or(Severity::Medium);
            channels.push(Channel::new("slack", min, slack_handler(webhook_url)));
        }

        let log_min = Severity::from_str(&config.log_min_severity).unwrap_or(Severity::Low);
        channels.push(Channel::new("log", log_min, log_handler()));

        if let Some(relay_url) = &config.push_relay_url {
            let min = Severity::from_str(&config.push_min_severity).unwrap_or(Severity::High);
            channels.push(Channel::new(
                "push",
                min,
                push_handler(
                    relay_url,
                    config.push_relay_token.as_deref(),
                    config.push_device_token.as_deref(),
                ),
            ));
        }

        Self::new(channels)
    }

    pub fn subscribe(dispatcher: Arc<Self>, bus: &EventBus) {
        bus.subscribe(&[types::ALERT_NEW], {
            Arc::new(move |event| {
                let dispatcher = dispatcher.clone();
                Box::pin(async move {
                    dispatcher.dispatch(event.payload).await;
                    Ok(())
                })
            })
        });
    }

    /// Send the alert to every channel whose severity threshold is met.
    pub async fn dispatch(&self, alert_payload: Value) {
        let severity = alert_payload["severity"]
            .as_str()
            .and_then(Severity::from_str)
            .unwrap_or(Severity::Low);

        for channel in &self.channels {
            if !channel.accepts(severity) {
                continue;
            }
            if let Err(e) = (channel.handler)(alert_payload.clone()).await {
                log::error!(
                    "Alert dispatch failed for channel {} (alert_id={}): {e:#}",
                    channel.name,
                    alert_payload["alert_id"]
                );
            }
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

// -- Slack ------------------------------------------------------------

/// Build a Slack Block Kit message from an alert payload.
pub fn format_slack_payload(alert: &Value, include_device_info: bool) -> Value {
    let severity_str = alert["severity"].as_str().unwrap_or("low");
    let severity = Severity::from_str(severity_str).unwrap_or(Severity::Low);
    let emoji = severity.emoji();
    let title = alert["title"].as_str().unwrap_or("Alert");
    let alert_type = alert["alert_type"].as_str().unwrap_or("");
    let created_at = alert["created_at"].as_str().unwrap_or("");

    let mut blocks = vec![
        json!({
            "type": "header",
            "text": {"type": "plain_text", "text": format!("{emoji} {title}")},
        }),
        json!({
            "type": "section",
            "fields": [
                {"type": "mrkdwn", "text": format!("*Severity:* {emoji} {}", severity_str.to_uppercase())},
                {"type": "mrkdwn", "text": format!("*Type:* `{alert_type}`")},
            ],
        }),
    ];

    if let Some(source_ip) = alert["source_ip"].as_str() {
        blocks.push(json!({
            "type": "section",
            "fields": [
                {"type": "mrkdwn", "text": format!("*Source IP:* `{source_ip}`")},
                {"type": "mrkdwn", "text": format!("*Time:* {created_at}")},
            ],
        }));
    } else {
        blocks.push(json!({
            "type": "section",
            "fields": [{"type": "mrkdwn", "text": format!("*Time:* {created_at}")}],
        }));
    }

    if let Some(detail) = alert["detail"].as_str() {
        if !detail.is_empty() {
            blocks.push(json!({
                "type": "section",
                "text": {"type": "mrkdwn", "text": format!("_{detail}_")},
            }));
        }
    }

    if include_device_info {
        let mut fields = Vec::new();
        if let Some(mac) = alert["source_mac"].as_str() {
            fields.push(json!({"type": "mrkdwn", "text": format!("*MAC:* `{mac}`")}));
        }
        if let Some(device_id) = alert["device_id"].as_i64() {
            fields.push(json!({"type": "mrkdwn", "text": format!("*Device ID:* {device_id}")}));
        }
        if !fields.is_empty() {
            blocks.push(json!({"type": "section", "fields": fields}));
        }
    }

    json!({
        "text": format!("{emoji} [{}] {title}", severity_str.to_uppercase()),
        "blocks": blocks,
    })
}

fn slack_handler(webhook_url: &str) -> AlertHandler {
    let webhook_url = webhook_url.to_string();
    let client = reqwest::Client::builder()
        .timeout(DELIVERY_TIMEOUT)
        .build()
        .expect("reqwest client");

    Arc::new(move |alert: Value| {
        let webhook_url = webhook_url.clone();
        let client = client.clone();
        Box::pin(async move {
            let message = format_slack_payload(&alert, false);
            client
                .post(&webhook_url)
                .json(&message)
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        })
    })
}

// -- Structured log ---------------------------------------------------

/// Single-line JSON at info; survives even when every network channel
/// is down.
fn log_handler() -> AlertHandler {
    Arc::new(move |alert: Value| {
        Box::pin(async move {
            log::info!(target: "squirrelops::alerts", "{alert}");
            Ok(())
        })
    })
}

// -- Push relay -------------------------------------------------------

fn push_handler(
    relay_url: &str,
    relay_token: Option<&str>,
    device_token: Option<&str>,
) -> AlertHandler {
    let relay_url = relay_url.to_string();
    let relay_token = relay_token.map(str::to_string);
    let device_token = device_token.map(str::to_string);
    let client = reqwest::Client::builder()
        .timeout(DELIVERY_TIMEOUT)
        .build()
        .expect("reqwest client");

    Arc::new(move |alert: Value| {
        let relay_url = relay_url.clone();
        let relay_token = relay_token.clone();
        let device_token = device_token.clone();
        let client = client.clone();
        Box::pin(async move {
            let Some(device_token) = device_token else {
                log::debug!("Push handler: no device token registered, skipping");
                return Ok(());
            };

            let body = json!({
                "device_token": device_token,
                "title": alert["title"].as_str().unwrap_or("SquirrelOps Alert"),
                "body": alert["detail"].as_str().unwrap_or(""),
                "category": alert["alert_type"].as_str().unwrap_or("ALERT"),
                "severity": alert["severity"].as_str().unwrap_or("low"),
            });

            let mut request = client.post(&relay_url).json(&body);
            if let Some(token) = relay_token {
                request = request.bearer_auth(token);
            }
            let response = request.send().await?;
            if !response.status().is_success() {
                log::warn!("Push relay returned {}", response.status());
            }
            Ok(())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn recording_channel(
        name: &str,
        min_severity: Severity,
        received: Arc<Mutex<Vec<Value>>>,
    ) -> Channel {
        Channel::new(
            name,
            min_severity,
            Arc::new(move |alert| {
                let received = received.clone();
                Box::pin(async move {
                    received.lock().unwrap().push(alert);
                    Ok(())
                })
            }),
        )
    }

    fn alert(severity: &str) -> Value {
        json!({
            "alert_id": 1,
            "alert_type": "decoy.credential_trip",
            "severity": severity,
            "title": "Planted credential used by 192.168.1.99",
            "detail": "Canary DNS lookup",
            "source_ip": "192.168.1.99",
            "created_at": "2025-06-01T10:00:00.000Z",
        })
    }

    #[tokio::test]
    async fn test_severity_threshold_gates_channels() {
        let all = Arc::new(Mutex::new(Vec::new()));
        let critical_only = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = AlertDispatcher::new(vec![
            recording_channel("log", Severity::Low, all.clone()),
            recording_channel("push", Severity::Critical, critical_only.clone()),
        ]);

        dispatcher.dispatch(alert("medium")).await;
        assert_eq!(all.lock().unwrap().len(), 1);
        assert_eq!(critical_only.lock().unwrap().len(), 0);

        dispatcher.dispatch(alert("critical")).await;
        assert_eq!(all.lock().unwrap().len(), 2);
        assert_eq!(critical_only.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_channel_does_not_block_others() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let dispatcher = AlertDispatcher::new(vec![
            Channel::new(
                "broken",
                Severity::Low,
                Arc::new(|_alert| Box::pin(async { anyhow::bail!("webhook down") })),
            ),
            Channel::new(
                "working",
                Severity::Low,
                Arc::new(move |_alert| {
                    let count = count_clone.clone();
                    Box::pin(async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            ),
        ]);

        dispatcher.dispatch(alert("high")).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_channel_list_is_noop() {
        let dispatcher = AlertDispatcher::new(Vec::new());
        dispatcher.dispatch(alert("critical")).await;
        assert_eq!(dispatcher.channel_count(), 0);
    }

    #[test]
    fn test_slack_payload_structure() {
        let message = format_slack_payload(&alert("critical"), false);
        let text = message["text"].as_str().unwrap();
        assert!(text.contains("[CRITICAL]"));

        let blocks = message["blocks"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "header");
        let rendered = message.to_string();
        assert!(rendered.contains("192.168.1.99"));
        assert!(rendered.contains("decoy.credential_trip"));
    }

    #[test]
    fn test_slack_payload_device_info_optional() {
        let mut payload = alert("high");
        payload["source_mac"] = json!("AA:BB:CC:DD:EE:FF");
        payload["device_id"] = json!(42);

        let without = format_slack_payload(&payload, false).to_string();
        assert!(!without.contains("AA:BB:CC:DD:EE:FF"));

        let with = format_slack_payload(&payload, true).to_string();
        assert!(with.contains("AA:BB:CC:DD:EE:FF"));
        assert!(with.contains("Device ID"));
    }

    #[test]
    fn test_from_config_builds_channels() {
        let config = AlertConfig {
            slack_webhook_url: Some("https://hooks.slack.com/services/T/B/X".to_string()),
            push_relay_url: Some("https://relay.example.com/push".to_string()),
            ..Default::default()
        };
        let dispatcher = AlertDispatcher::from_config(&config);
        // slack + log + push
        assert_eq!(dispatcher.channel_count(), 3);

        let minimal = AlertDispatcher::from_config(&AlertConfig::default());
        assert_eq!(minimal.channel_count(), 1);
    }
}
