use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::alerts::Severity;
use crate::db::queries::alerts as db_alerts;
use crate::db::DbPool;
use crate::error::Result;
use crate::events::{types, EventBus};
use crate::timefmt;

/// Groups alerts from the same source IP within a sliding window into
/// parent incidents.
///
/// Lifecycle: active while new alerts keep arriving within the window;
/// closed once `last_alert_at` falls behind the close window. Closed
/// incidents are immutable; later alerts from the same source open a
/// new incident.
pub struct IncidentGrouper {
    pool: DbPool,
    bus: Arc<EventBus>,
    incident_window: chrono::Duration,
    close_window: chrono::Duration,
}

#[derive(Debug, Clone)]
struct IncidentRow {
    id: i64,
    severity: String,
    alert_count: i64,
}

impl IncidentGrouper {
    pub fn new(
        pool: DbPool,
        bus: Arc<EventBus>,
        incident_window_minutes: i64,
        incident_close_window_minutes: i64,
    ) -> Self {
        Self {
            pool,
            bus,
            incident_window: chrono::Duration::minutes(incident_window_minutes),
            close_window: chrono::Duration::minutes(incident_close_window_minutes),
        }
    }

    /// Subscribe to `alert.new` so every inserted alert is grouped.
    pub fn subscribe(grouper: Arc<Self>, bus: &EventBus) {
        bus.subscribe(&[types::ALERT_NEW], {
            let grouper = grouper.clone();
            Arc::new(move |event| {
                let grouper = grouper.clone();
                Box::pin(async move {
                    if let Some(alert_id) = event.payload["alert_id"].as_i64() {
                        grouper.process_alert(alert_id).await?;
                    }
                    Ok(())
                })
            })
        });
    }

    /// Attach an alert to a matching active incident or open a new one.
    /// Alerts without a source IP stay standalone.
    pub async fn process_alert(&self, alert_id: i64) -> Result<()> {
        let alert = {
            let conn = self.pool.get()?;
            db_alerts::get_alert(&conn, alert_id)?
        };
        let Some(alert) = alert else {
            return Ok(());
        };
        let Some(source_ip) = alert.source_ip.clone() else {
            return Ok(());
        };

        let alert_time = timefmt::parse_iso(&alert.created_at).unwrap_or_else(Utc::now);
        let alert_severity =
            Severity::from_str(&alert.severity).unwrap_or(Severity::Low);

        let existing = self.find_active_incident(&source_ip, alert_time)?;

        match existing {
            Some(incident) => {
                self.attach_to_incident(&alert, &incident, alert_severity, alert_time)
                    .await
            }
            None => self.create_incident(&alert, alert_severity, alert_time).await,
        }
    }

    fn find_active_incident(
        &self,
        source_ip: &str,
        alert_time: DateTime<Utc>,
    ) -> Result<Option<IncidentRow>> {
        let window_start = timefmt::format_iso(alert_time - self.incident_window);
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT id, severity, alert_count FROM incidents
                 WHERE source_ip = ?1 AND status = 'active' AND last_alert_at >= ?2
                 ORDER BY last_alert_at DESC LIMIT 1",
                params![source_ip, window_start],
                |row| {
                    Ok(IncidentRow {
                        id: row.get(0)?,
                        severity: row.get(1)?,
                        alert_count: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    async fn attach_to_incident(
        &self,
        alert: &db_alerts::AlertRow,
        incident: &IncidentRow,
        alert_severity: Severity,
        alert_time: DateTime<Utc>,
    ) -> Result<()> {
        let current = Severity::from_str(&incident.severity).unwrap_or(Severity::Low);
        // Severity only ever escalates.
        let new_severity = current.max(alert_severity);
        let new_count = incident.alert_count + 1;
        let last_alert_at = timefmt::format_iso(alert_time);

        {
            let conn = self.pool.get()?;
            db_alerts::link_incident(&conn, alert.id, incident.id)?;
            conn.execute(
                "UPDATE incidents SET alert_count = ?1, last_alert_at = ?2, severity = ?3
                 WHERE id = ?4",
                params![new_count, last_alert_at, new_severity.as_str(), incident.id],
            )?;
            let summary = self.generate_summary(&conn, incident.id)?;
            conn.execute(
                "UPDATE incidents SET summary = ?1 WHERE id = ?2",
                params![summary, incident.id],
            )?;
        }

        self.bus
            .publish(
                types::INCIDENT_UPDATED,
                json!({
                    "incident_id": incident.id,
                    "alert_count": new_count,
                    "severity": new_severity.as_str(),
                }),
                None,
            )
            .await?;
        Ok(())
    }

    async fn create_incident(
        &self,
        alert: &db_alerts::AlertRow,
        alert_severity: Severity,
        alert_time: DateTime<Utc>,
    ) -> Result<()> {
        let time_str = timefmt::format_iso(alert_time);

        let incident_id = {
            let conn = self.pool.get()?;
            conn.execute(
                "INSERT INTO incidents
                    (source_ip, source_mac, status, severity, alert_count,
                     first_alert_at, last_alert_at)
                 VALUES (?1, ?2, 'active', ?3, 1, ?4, ?4)",
                params![
                    alert.source_ip,
                    alert.source_mac,
                    alert_severity.as_str(),
                    time_str
                ],
            )?;
            let incident_id = conn.last_insert_rowid();
            db_alerts::link_incident(&conn, alert.id, incident_id)?;
            let summary = self.generate_summary(&conn, incident_id)?;
            conn.execute(
                "UPDATE incidents SET summary = ?1 WHERE id = ?2",
                params![summary, incident_id],
            )?;
            incident_id
        };

        self.bus
            .publish(
                types::INCIDENT_NEW,
                json!({
                    "incident_id": incident_id,
                    "source_ip": alert.source_ip,
                    "severity": alert_severity.as_str(),
                }),
                None,
            )
            .await?;
        Ok(())
    }

    /// Close active incidents whose last alert is older than the close
    /// window. Returns the number closed.
    pub fn close_stale_incidents(&self) -> Result<usize> {
        let now = Utc::now();
        let cutoff = timefmt::format_iso(now - self.close_window);
        let conn = self.pool.get()?;
        let closed = conn.execute(
            "UPDATE incidents SET status = 'closed', closed_at = ?1
             WHERE status = 'active' AND last_alert_at < ?2",
            params![timefmt::format_iso(now), cutoff],
        )?;
        Ok(closed)
    }

    /// Periodic closure job.
    pub async fn run_closer(&self, shutdown: CancellationToken, interval: Duration) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match self.close_stale_incidents() {
                Ok(0) => {}
                Ok(closed) => log::info!("Closed {closed} stale incidents"),
                Err(e) => log::warn!("Incident closure pass failed: {e}"),
            }
        }
    }

    /// `"{N} event[s] from {ip}[ over {duration}]: type1 (×k) → type2"`.
    fn generate_summary(&self, conn: &rusqlite::Connection, incident_id: i64) -> Result<String> {
        let (source_ip, count, first_at, last_at): (String, i64, String, String) = conn
            .query_row(
                "SELECT source_ip, alert_count, first_alert_at, last_alert_at
                 FROM incidents WHERE id = ?1",
                [incident_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

        let alert_types = db_alerts::alert_types_for_incident(conn, incident_id)?;
        let type_list = collapse_consecutive(&alert_types).join(" \u{2192} ");
        let event_word = if count == 1 { "event" } else { "events" };

        let duration = match (timefmt::parse_iso(&first_at), timefmt::parse_iso(&last_at)) {
            (Some(first), Some(last)) => last - first,
            _ => chrono::Duration::zero(),
        };

        if duration.num_seconds() < 1 {
            Ok(format!("{count} {event_word} from {source_ip}: {type_list}"))
        } else {
            Ok(format!(
                "{count} {event_word} from {source_ip} over {}: {type_list}",
                timefmt::format_duration(duration)
            ))
        }
    }
}

/// Collapse consecutive duplicates with counts:
/// `[a, a, a, b]` becomes `["a (×3)", "b"]`.
fn collapse_consecutive(items: &[String]) -> Vec<String> {
    let mut result = Vec::new();
    let mut iter = items.iter();
    let Some(mut current) = iter.next() else {
        return result;
    };
    let mut count = 1usize;

    for item in iter {
        if item == current {
            count += 1;
        } else {
            result.push(render_collapsed(current, count));
            current = item;
            count = 1;
        }
    }
    result.push(render_collapsed(current, count));
    result
}

fn render_collapsed(item: &str, count: usize) -> String {
    if count == 1 {
        item.to_string()
    } else {
        format!("{item} (\u{d7}{count})")
    }
}
