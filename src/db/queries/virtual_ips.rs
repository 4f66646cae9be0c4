use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone)]
pub struct VirtualIpRow {
    pub ip_address: String,
    pub interface: String,
    pub decoy_id: Option<i64>,
    pub state: String,
}

pub fn upsert_state(
    conn: &Connection,
    ip: &str,
    interface: &str,
    state: &str,
    now: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO virtual_ips (ip_address, interface, state, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(ip_address) DO UPDATE SET
            interface = excluded.interface,
            state = excluded.state,
            updated_at = excluded.updated_at",
        params![ip, interface, state, now],
    )?;
    Ok(())
}

pub fn get_state(conn: &Connection, ip: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT state FROM virtual_ips WHERE ip_address = ?1",
        [ip],
        |row| row.get(0),
    )
    .optional()
}

pub fn link_decoy(
    conn: &Connection,
    ip: &str,
    decoy_id: Option<i64>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE virtual_ips SET decoy_id = ?1 WHERE ip_address = ?2",
        params![decoy_id, ip],
    )?;
    Ok(())
}

pub fn list_by_state(conn: &Connection, state: &str) -> Result<Vec<VirtualIpRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT ip_address, interface, decoy_id, state FROM virtual_ips WHERE state = ?1",
    )?;
    let rows = stmt.query_map([state], |row| {
        Ok(VirtualIpRow {
            ip_address: row.get(0)?,
            interface: row.get(1)?,
            decoy_id: row.get(2)?,
            state: row.get(3)?,
        })
    })?;
    rows.collect()
}

pub fn delete(conn: &Connection, ip: &str) -> Result<(), rusqlite::Error> {
    conn.execute("DELETE FROM virtual_ips WHERE ip_address = ?1", [ip])?;
    Ok(())
}

pub fn delete_for_decoy(conn: &Connection, decoy_id: i64) -> Result<(), rusqlite::Error> {
    conn.execute("DELETE FROM virtual_ips WHERE decoy_id = ?1", [decoy_id])?;
    Ok(())
}
