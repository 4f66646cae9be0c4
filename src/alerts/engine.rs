use std::sync::Arc;

use serde_json::json;

use crate::db::queries::{alerts as db_alerts, credentials as db_credentials, decoys as db_decoys};
use crate::db::DbPool;
use crate::error::Result;
use crate::events::{types, Event, EventBus};
use crate::timefmt;

/// Turns decoy activity events into persisted alerts.
///
/// Subscribes to `decoy.trip` and `decoy.credential_trip`; records the
/// connection, bumps decoy counters, marks tripped credentials, inserts
/// the `home_alerts` row and publishes `alert.new` with the full alert
/// payload. The incident grouper and dispatcher hang off `alert.new`.
pub struct AlertEngine {
    pool: DbPool,
    bus: Arc<EventBus>,
}

impl AlertEngine {
    pub fn new(pool: DbPool, bus: Arc<EventBus>) -> Self {
        Self { pool, bus }
    }

    pub fn subscribe(engine: Arc<Self>, bus: &EventBus) {
        bus.subscribe(&[types::DECOY_TRIP], {
            let engine = engine.clone();
            Arc::new(move |event| {
                let engine = engine.clone();
                Box::pin(async move {
                    engine.handle_trip(event).await?;
                    Ok(())
                })
            })
        });
        bus.subscribe(&[types::DECOY_CREDENTIAL_TRIP], {
            let engine = engine.clone();
            Arc::new(move |event| {
                let engine = engine.clone();
                Box::pin(async move {
                    engine.handle_credential_trip(event).await?;
                    Ok(())
                })
            })
        });
    }

    /// Any connection to a decoy is suspicious on a home network.
    async fn handle_trip(&self, event: Event) -> Result<()> {
        let payload = &event.payload;
        let decoy_id = payload["decoy_id"].as_i64();
        let source_ip = payload["source_ip"].as_str().unwrap_or("unknown").to_string();
        let dest_port = payload["dest_port"].as_u64().unwrap_or(0) as u16;
        let request_path = payload["request_path"].as_str();
        let now = timefmt::now_iso();

        let alert_id = {
            let conn = self.pool.get()?;
            db_decoys::insert_connection(
                &conn,
                decoy_id,
                &source_ip,
                payload["source_port"].as_u64().unwrap_or(0) as u16,
                dest_port,
                payload["protocol"].as_str().unwrap_or("tcp"),
                request_path,
                None,
                payload["timestamp"].as_str().unwrap_or(&now),
            )?;
            if let Some(decoy_id) = decoy_id {
                db_decoys::increment_connection_count(&conn, decoy_id)?;
            }

            let detail = match request_path {
                Some(path) => format!("Request for {path} on decoy port {dest_port}"),
                None => format!("Connection to decoy port {dest_port}"),
            };
            db_alerts::insert_alert(
                &conn,
                &db_alerts::NewAlert {
                    alert_type: "decoy.trip",
                    severity: "medium",
                    title: &format!("Decoy contacted by {source_ip}"),
                    detail: Some(&detail),
                    source_ip: Some(&source_ip),
                    decoy_id,
                    event_seq: Some(event.seq),
                    created_at: &now,
                    ..Default::default()
                },
            )?
        };

        self.publish_alert_new(alert_id).await
    }

    /// A planted credential was used; the strongest possible signal.
    async fn handle_credential_trip(&self, event: Event) -> Result<()> {
        let payload = &event.payload;
        let decoy_id = payload["decoy_id"].as_i64();
        let source_ip = payload["source_ip"]
            .as_str()
            .or_else(|| payload["queried_by_ip"].as_str())
            .unwrap_or("unknown")
            .to_string();
        let detection_method = payload["detection_method"].as_str().unwrap_or("decoy");
        let now = timefmt::now_iso();

        let alert_id = {
            let conn = self.pool.get()?;

            if let Some(value) = payload["credential_used"].as_str() {
                if let Some(credential) = db_credentials::get_by_value(&conn, value)? {
                    db_credentials::mark_tripped(&conn, credential.id, &now)?;
                }
            }
            if let Some(credential_id) = payload["credential_id"].as_i64() {
                db_credentials::mark_tripped(&conn, credential_id, &now)?;
            }
            if let Some(decoy_id) = decoy_id {
                db_decoys::increment_credential_trip_count(&conn, decoy_id)?;
            }

            let detail = match payload["canary_hostname"].as_str() {
                Some(hostname) => {
                    format!("Canary DNS lookup for {hostname} (via {detection_method})")
                }
                None => format!("Planted credential replayed (via {detection_method})"),
            };
            db_alerts::insert_alert(
                &conn,
                &db_alerts::NewAlert {
                    alert_type: "decoy.credential_trip",
                    severity: "critical",
                    title: &format!("Planted credential used by {source_ip}"),
                    detail: Some(&detail),
                    source_ip: Some(&source_ip),
                    decoy_id,
                    event_seq: Some(event.seq),
                    created_at: &now,
                    ..Default::default()
                },
            )?
        };

        self.publish_alert_new(alert_id).await
    }

    async fn publish_alert_new(&self, alert_id: i64) -> Result<()> {
        let alert = {
            let conn = self.pool.get()?;
            db_alerts::get_alert(&conn, alert_id)?
        };
        let Some(alert) = alert else {
            return Ok(());
        };

        self.bus
            .publish(
                types::ALERT_NEW,
                json!({
                    "alert_id": alert.id,
                    "alert_type": alert.alert_type,
                    "severity": alert.severity,
                    "title": alert.title,
                    "detail": alert.detail,
                    "source_ip": alert.source_ip,
                    "source_mac": alert.source_mac,
                    "device_id": alert.device_id,
                    "decoy_id": alert.decoy_id,
                    "event_seq": alert.event_seq,
                    "created_at": alert.created_at,
                }),
                None,
            )
            .await?;
        Ok(())
    }
}
