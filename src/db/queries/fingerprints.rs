use rusqlite::{params, Connection};

use crate::fingerprint::composite::CompositeFingerprint;

/// Append a fingerprint row for a device. Fingerprints are append-only
/// history; the newest row is the active one.
pub fn insert_fingerprint(
    conn: &Connection,
    device_id: i64,
    fp: &CompositeFingerprint,
    confidence: Option<f64>,
    now: &str,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO device_fingerprints
            (device_id, mac_address, mdns_hostname, dhcp_fingerprint_hash,
             connection_pattern_hash, open_ports_hash, composite_hash,
             signal_count, confidence, first_seen, last_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            device_id,
            fp.mac_address,
            fp.mdns_hostname,
            fp.dhcp_fingerprint_hash,
            fp.connection_pattern_hash,
            fp.open_ports_hash,
            fp.composite_hash,
            fp.signal_count() as i64,
            confidence,
            now
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn count_for_device(conn: &Connection, device_id: i64) -> Result<i64, rusqlite::Error> {
    conn.query_row(
        "SELECT COUNT(*) FROM device_fingerprints WHERE device_id = ?1",
        [device_id],
        |row| row.get(0),
    )
}
