use std::collections::HashMap;

use rusqlite::Connection;

use crate::timefmt;

/// Purge records older than `days`, preserving alerts linked to active
/// incidents. Event sequence numbers are never reused afterwards; the
/// autoincrement counter survives deletes.
///
/// Returns per-table purge counts.
pub fn purge_old_records(
    conn: &Connection,
    days: u32,
) -> Result<HashMap<&'static str, usize>, rusqlite::Error> {
    let cutoff = timefmt::format_iso(chrono::Utc::now() - chrono::Duration::days(days as i64));
    let mut counts = HashMap::new();

    let alerts = conn.execute(
        "DELETE FROM home_alerts
         WHERE created_at < ?1
           AND (incident_id IS NULL
                OR incident_id IN (SELECT id FROM incidents WHERE status = 'closed'))",
        [&cutoff],
    )?;
    counts.insert("alerts", alerts);

    let incidents = conn.execute(
        "DELETE FROM incidents WHERE status = 'closed' AND closed_at < ?1",
        [&cutoff],
    )?;
    counts.insert("incidents", incidents);

    let events = conn.execute("DELETE FROM events WHERE created_at < ?1", [&cutoff])?;
    counts.insert("events", events);

    let connections = conn.execute(
        "DELETE FROM decoy_connections WHERE timestamp < ?1",
        [&cutoff],
    )?;
    counts.insert("decoy_connections", connections);

    let observations = conn.execute(
        "DELETE FROM canary_observations WHERE observed_at < ?1",
        [&cutoff],
    )?;
    counts.insert("canary_observations", observations);

    Ok(counts)
}
