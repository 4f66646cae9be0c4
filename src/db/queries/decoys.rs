use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// A decoy row as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoyRow {
    pub id: i64,
    pub name: String,
    pub decoy_type: String,
    pub bind_address: String,
    pub port: u16,
    pub status: String,
    pub config: Option<String>,
    pub connection_count: i64,
    pub credential_trip_count: i64,
    pub failure_count: i64,
    pub last_failure_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn row_to_decoy(row: &rusqlite::Row<'_>) -> Result<DecoyRow, rusqlite::Error> {
    Ok(DecoyRow {
        id: row.get(0)?,
        name: row.get(1)?,
        decoy_type: row.get(2)?,
        bind_address: row.get(3)?,
        port: row.get(4)?,
        status: row.get(5)?,
        config: row.get(6)?,
        connection_count: row.get(7)?,
        credential_trip_count: row.get(8)?,
        failure_count: row.get(9)?,
        last_failure_at: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

const DECOY_COLUMNS: &str = "id, name, decoy_type, bind_address, port, status, config, \
     connection_count, credential_trip_count, failure_count, last_failure_at, \
     created_at, updated_at";

pub fn insert_decoy(
    conn: &Connection,
    name: &str,
    decoy_type: &str,
    bind_address: &str,
    port: u16,
    config: &str,
    now: &str,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO decoys (name, decoy_type, bind_address, port, status, config, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?6)",
        params![name, decoy_type, bind_address, port, config, now],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_decoy(conn: &Connection, decoy_id: i64) -> Result<Option<DecoyRow>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {DECOY_COLUMNS} FROM decoys WHERE id = ?1"),
        [decoy_id],
        |row| row_to_decoy(row),
    )
    .optional()
}

pub fn list_active_by_type(
    conn: &Connection,
    decoy_type_filter: ActiveFilter,
) -> Result<Vec<DecoyRow>, rusqlite::Error> {
    let sql = match decoy_type_filter {
        ActiveFilter::NonMimic => format!(
            "SELECT {DECOY_COLUMNS} FROM decoys WHERE status = 'active' AND decoy_type != 'mimic'"
        ),
        ActiveFilter::Mimic => format!(
            "SELECT {DECOY_COLUMNS} FROM decoys WHERE status = 'active' AND decoy_type = 'mimic'"
        ),
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| row_to_decoy(row))?;
    rows.collect()
}

#[derive(Debug, Clone, Copy)]
pub enum ActiveFilter {
    NonMimic,
    Mimic,
}

pub fn count_decoys(conn: &Connection) -> Result<i64, rusqlite::Error> {
    conn.query_row("SELECT COUNT(*) FROM decoys", [], |row| row.get(0))
}

pub fn update_status(
    conn: &Connection,
    decoy_id: i64,
    status: &str,
    now: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE decoys SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status, now, decoy_id],
    )?;
    Ok(())
}

pub fn update_port(
    conn: &Connection,
    decoy_id: i64,
    port: u16,
    now: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE decoys SET port = ?1, updated_at = ?2 WHERE id = ?3",
        params![port, now, decoy_id],
    )?;
    Ok(())
}

pub fn update_config(
    conn: &Connection,
    decoy_id: i64,
    config: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE decoys SET config = ?1 WHERE id = ?2",
        params![config, decoy_id],
    )?;
    Ok(())
}

pub fn record_failure(conn: &Connection, decoy_id: i64, now: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE decoys SET failure_count = failure_count + 1, last_failure_at = ?1,
                           updated_at = ?1
         WHERE id = ?2",
        params![now, decoy_id],
    )?;
    Ok(())
}

pub fn increment_connection_count(
    conn: &Connection,
    decoy_id: i64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE decoys SET connection_count = connection_count + 1 WHERE id = ?1",
        [decoy_id],
    )?;
    Ok(())
}

pub fn increment_credential_trip_count(
    conn: &Connection,
    decoy_id: i64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE decoys SET credential_trip_count = credential_trip_count + 1 WHERE id = ?1",
        [decoy_id],
    )?;
    Ok(())
}

pub fn delete_decoy(conn: &Connection, decoy_id: i64) -> Result<(), rusqlite::Error> {
    conn.execute("DELETE FROM decoys WHERE id = ?1", [decoy_id])?;
    Ok(())
}

pub fn insert_connection(
    conn: &Connection,
    decoy_id: Option<i64>,
    source_ip: &str,
    source_port: u16,
    dest_port: u16,
    protocol: &str,
    request_path: Option<&str>,
    credential_used: Option<&str>,
    timestamp: &str,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO decoy_connections
            (decoy_id, source_ip, source_port, dest_port, protocol, request_path,
             credential_used, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            decoy_id,
            source_ip,
            source_port,
            dest_port,
            protocol,
            request_path,
            credential_used,
            timestamp
        ],
    )?;
    Ok(conn.last_insert_rowid())
}
