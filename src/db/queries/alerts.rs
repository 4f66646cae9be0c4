use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// A home alert row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRow {
    pub id: i64,
    pub incident_id: Option<i64>,
    pub alert_type: String,
    pub severity: String,
    pub title: String,
    pub detail: Option<String>,
    pub source_ip: Option<String>,
    pub source_mac: Option<String>,
    pub device_id: Option<i64>,
    pub decoy_id: Option<i64>,
    pub read_at: Option<String>,
    pub actioned_at: Option<String>,
    pub action_note: Option<String>,
    pub event_seq: Option<i64>,
    pub created_at: String,
}

/// Insert parameters for a new alert.
#[derive(Debug, Clone, Default)]
pub struct NewAlert<'a> {
    pub alert_type: &'a str,
    pub severity: &'a str,
    pub title: &'a str,
    pub detail: Option<&'a str>,
    pub source_ip: Option<&'a str>,
    pub source_mac: Option<&'a str>,
    pub device_id: Option<i64>,
    pub decoy_id: Option<i64>,
    pub event_seq: Option<i64>,
    pub created_at: &'a str,
}

const COLUMNS: &str = "id, incident_id, alert_type, severity, title, detail, source_ip, \
     source_mac, device_id, decoy_id, read_at, actioned_at, action_note, event_seq, created_at";

fn row_to_alert(row: &rusqlite::Row<'_>) -> Result<AlertRow, rusqlite::Error> {
    Ok(AlertRow {
        id: row.get(0)?,
        incident_id: row.get(1)?,
        alert_type: row.get(2)?,
        severity: row.get(3)?,
        title: row.get(4)?,
        detail: row.get(5)?,
        source_ip: row.get(6)?,
        source_mac: row.get(7)?,
        device_id: row.get(8)?,
        decoy_id: row.get(9)?,
        read_at: row.get(10)?,
        actioned_at: row.get(11)?,
        action_note: row.get(12)?,
        event_seq: row.get(13)?,
        created_at: row.get(14)?,
    })
}

pub fn insert_alert(conn: &Connection, alert: &NewAlert<'_>) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO home_alerts
            (alert_type, severity, title, detail, source_ip, source_mac, device_id,
             decoy_id, event_seq, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            alert.alert_type,
            alert.severity,
            alert.title,
            alert.detail,
            alert.source_ip,
            alert.source_mac,
            alert.device_id,
            alert.decoy_id,
            alert.event_seq,
            alert.created_at
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_alert(conn: &Connection, alert_id: i64) -> Result<Option<AlertRow>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM home_alerts WHERE id = ?1"),
        [alert_id],
        |row| row_to_alert(row),
    )
    .optional()
}

pub fn mark_read(conn: &Connection, alert_id: i64, now: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE home_alerts SET read_at = ?1 WHERE id = ?2 AND read_at IS NULL",
        params![now, alert_id],
    )?;
    Ok(())
}

pub fn mark_actioned(
    conn: &Connection,
    alert_id: i64,
    note: Option<&str>,
    now: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE home_alerts SET actioned_at = ?1, action_note = ?2 WHERE id = ?3",
        params![now, note, alert_id],
    )?;
    Ok(())
}

pub fn link_incident(
    conn: &Connection,
    alert_id: i64,
    incident_id: i64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE home_alerts SET incident_id = ?1 WHERE id = ?2",
        params![incident_id, alert_id],
    )?;
    Ok(())
}

pub fn alert_types_for_incident(
    conn: &Connection,
    incident_id: i64,
) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT alert_type FROM home_alerts WHERE incident_id = ?1 ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map([incident_id], |row| row.get(0))?;
    rows.collect()
}
