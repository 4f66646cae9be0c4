use std::collections::BTreeSet;
use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use serde_json::json;

use crate::alerts::Severity;
use crate::db::queries::alerts as db_alerts;
use crate::db::DbPool;
use crate::error::Result;
use crate::events::{types, EventBus};
use crate::timefmt;

/// A risky-exposure rule keyed on a single open port.
struct RiskyPort {
    port: u16,
    severity: Severity,
    title: &'static str,
    detail: &'static str,
}

const RISKY_PORTS: &[RiskyPort] = &[
    RiskyPort {
        port: 23,
        severity: Severity::High,
        title: "Telnet enabled",
        detail: "Telnet sends credentials in cleartext and is a common IoT backdoor.",
    },
    RiskyPort {
        port: 21,
        severity: Severity::Medium,
        title: "FTP enabled",
        detail: "FTP transfers files and credentials unencrypted.",
    },
    RiskyPort {
        port: 445,
        severity: Severity::Medium,
        title: "SMB file sharing exposed",
        detail: "SMB is a frequent ransomware entry point on home networks.",
    },
    RiskyPort {
        port: 3389,
        severity: Severity::High,
        title: "Remote Desktop exposed",
        detail: "RDP is a primary target for credential stuffing.",
    },
    RiskyPort {
        port: 5900,
        severity: Severity::High,
        title: "VNC exposed",
        detail: "VNC often runs without a password on embedded devices.",
    },
];

/// A device snapshot the analyzer works from.
#[derive(Debug, Clone)]
pub struct DeviceExposure {
    pub device_id: i64,
    pub ip_address: String,
    pub display_name: String,
    pub open_ports: BTreeSet<u16>,
}

/// Generates security-insight alerts from open-port state.
///
/// Dedup contract: one alert per (device, insight) lifetime, tracked in
/// `security_insight_state`. When the port closes the insight is marked
/// resolved; it does NOT re-alert if the port reappears later.
pub struct SecurityInsightAnalyzer {
    pool: DbPool,
    bus: Arc<EventBus>,
}

impl SecurityInsightAnalyzer {
    pub fn new(pool: DbPool, bus: Arc<EventBus>) -> Self {
        Self { pool, bus }
    }

    /// Analyze every device; returns the number of new alerts created.
    pub async fn analyze_all_devices(&self, devices: &[DeviceExposure]) -> Result<usize> {
        let mut new_alerts = 0usize;
        for device in devices {
            new_alerts += self.analyze_device(device).await?;
        }
        Ok(new_alerts)
    }

    /// Analyze one device's open ports against the risky-port rules.
    pub async fn analyze_device(&self, device: &DeviceExposure) -> Result<usize> {
        let now = timefmt::now_iso();
        let mut new_alerts = 0usize;

        // Unencrypted admin page: HTTP without HTTPS.
        let unencrypted_admin =
            device.open_ports.contains(&80) && !device.open_ports.contains(&443);

        let mut findings: Vec<(String, Severity, String, String)> = Vec::new();
        for rule in RISKY_PORTS {
            if device.open_ports.contains(&rule.port) {
                findings.push((
                    format!("risky_port:{}", rule.port),
                    rule.severity,
                    rule.title.to_string(),
                    format!("{} ({} port {})", rule.detail, device.display_name, rule.port),
                ));
            }
        }
        if unencrypted_admin {
            findings.push((
                "unencrypted_admin:80".to_string(),
                Severity::Low,
                "Unencrypted admin interface".to_string(),
                format!("{} serves HTTP without HTTPS.", device.display_name),
            ));
        }

        let open_keys: BTreeSet<String> = findings.iter().map(|(key, ..)| key.clone()).collect();

        {
            let conn = self.pool.get()?;

            // Resolve insights whose condition no longer holds.
            let mut stmt = conn.prepare(
                "SELECT insight_key FROM security_insight_state
                 WHERE device_id = ?1 AND resolved_at IS NULL",
            )?;
            let current: Vec<String> = stmt
                .query_map([device.device_id], |row| row.get(0))?
                .collect::<std::result::Result<_, _>>()?;
            for key in current {
                if !open_keys.contains(&key) {
                    conn.execute(
                        "UPDATE security_insight_state SET resolved_at = ?1
                         WHERE device_id = ?2 AND insight_key = ?3",
                        params![now, device.device_id, key],
                    )?;
                }
            }
        }

        for (key, severity, title, detail) in findings {
            let already_notified = {
                let conn = self.pool.get()?;
                let existing: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM security_insight_state
                         WHERE device_id = ?1 AND insight_key = ?2",
                        params![device.device_id, key],
                        |row| row.get(0),
                    )
                    .optional()?;
                existing.is_some()
            };
            if already_notified {
                // One notification per device+insight lifetime. If it was
                // resolved in the meantime, reopen the state silently.
                let conn = self.pool.get()?;
                conn.execute(
                    "UPDATE security_insight_state SET resolved_at = NULL
                     WHERE device_id = ?1 AND insight_key = ?2",
                    params![device.device_id, key],
                )?;
                continue;
            }

            let alert_id = {
                let conn = self.pool.get()?;
                let alert_id = db_alerts::insert_alert(
                    &conn,
                    &db_alerts::NewAlert {
                        alert_type: "security_insight",
                        severity: severity.as_str(),
                        title: &title,
                        detail: Some(&detail),
                        source_ip: None,
                        device_id: Some(device.device_id),
                        created_at: &now,
                        ..Default::default()
                    },
                )?;
                conn.execute(
                    "INSERT INTO security_insight_state
                        (device_id, insight_key, alert_id, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![device.device_id, key, alert_id, now],
                )?;
                alert_id
            };

            self.bus
                .publish(
                    types::ALERT_NEW,
                    json!({
                        "alert_id": alert_id,
                        "alert_type": "security_insight",
                        "severity": severity.as_str(),
                        "title": title,
                        "detail": detail,
                        "device_id": device.device_id,
                        "source_ip": serde_json::Value::Null,
                        "created_at": now,
                    }),
                    None,
                )
                .await?;
            new_alerts += 1;
        }

        Ok(new_alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::db::queries::devices;
    use crate::events::EventLog;

    fn analyzer() -> (SecurityInsightAnalyzer, Arc<EventBus>, DbPool) {
        let pool = db::init_test_db();
        let bus = Arc::new(EventBus::new(EventLog::new(pool.clone())));
        (
            SecurityInsightAnalyzer::new(pool.clone(), bus.clone()),
            bus,
            pool,
        )
    }

    fn exposure(pool: &DbPool, ports: &[u16]) -> DeviceExposure {
        let conn = pool.get().unwrap();
        let device_id =
            devices::insert_device(&conn, "192.168.1.40", None, None, "Unknown", "iot", "t")
                .unwrap();
        DeviceExposure {
            device_id,
            ip_address: "192.168.1.40".to_string(),
            display_name: "192.168.1.40".to_string(),
            open_ports: ports.iter().copied().collect(),
        }
    }

    #[tokio::test]
    async fn test_telnet_creates_high_alert() {
        let (analyzer, bus, pool) = analyzer();
        let device = exposure(&pool, &[23]);

        let created = analyzer.analyze_device(&device).await.unwrap();
        assert_eq!(created, 1);

        let conn = pool.get().unwrap();
        let (severity, key): (String, String) = conn
            .query_row(
                "SELECT a.severity, s.insight_key
                 FROM home_alerts a JOIN security_insight_state s ON s.alert_id = a.id",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(severity, "high");
        assert_eq!(key, "risky_port:23");
        drop(conn);
        assert!(bus.replay(0).unwrap().iter().any(|e| e.event_type == "alert.new"));
    }

    #[tokio::test]
    async fn test_dedup_same_port() {
        let (analyzer, _, pool) = analyzer();
        let device = exposure(&pool, &[23]);

        assert_eq!(analyzer.analyze_device(&device).await.unwrap(), 1);
        assert_eq!(analyzer.analyze_device(&device).await.unwrap(), 0);

        let conn = pool.get().unwrap();
        let alerts: i64 = conn
            .query_row("SELECT COUNT(*) FROM home_alerts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(alerts, 1);
    }

    #[tokio::test]
    async fn test_resolution_and_no_re_alert() {
        let (analyzer, _, pool) = analyzer();
        let mut device = exposure(&pool, &[23]);

        analyzer.analyze_device(&device).await.unwrap();

        // Port closes: insight resolved.
        device.open_ports.clear();
        analyzer.analyze_device(&device).await.unwrap();
        let conn = pool.get().unwrap();
        let resolved: Option<String> = conn
            .query_row(
                "SELECT resolved_at FROM security_insight_state WHERE insight_key = 'risky_port:23'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(resolved.is_some());
        drop(conn);

        // Port reopens: no second alert, state reopened.
        device.open_ports.insert(23);
        assert_eq!(analyzer.analyze_device(&device).await.unwrap(), 0);
        let conn = pool.get().unwrap();
        let alerts: i64 = conn
            .query_row("SELECT COUNT(*) FROM home_alerts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(alerts, 1);
        let resolved: Option<String> = conn
            .query_row(
                "SELECT resolved_at FROM security_insight_state WHERE insight_key = 'risky_port:23'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn test_multiple_findings_counted() {
        let (analyzer, _, pool) = analyzer();
        // FTP + unencrypted admin page = 2 findings.
        let device = exposure(&pool, &[21, 80]);
        assert_eq!(analyzer.analyze_device(&device).await.unwrap(), 2);
    }
}
