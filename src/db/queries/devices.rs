use rusqlite::{params, Connection, OptionalExtension};

/// A device row joined with its most recent fingerprint, used to rebuild
/// in-memory tracking state at startup.
#[derive(Debug, Clone)]
pub struct DeviceWithFingerprint {
    pub id: i64,
    pub ip_address: String,
    pub mac_address: Option<String>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub device_type: String,
    pub model_name: Option<String>,
    pub area: Option<String>,
    pub first_seen: String,
    pub last_seen: String,
    pub fp_mdns_hostname: Option<String>,
    pub fp_dhcp_hash: Option<String>,
    pub fp_connection_hash: Option<String>,
    pub fp_open_ports_hash: Option<String>,
}

pub fn insert_device(
    conn: &Connection,
    ip_address: &str,
    mac_address: Option<&str>,
    hostname: Option<&str>,
    vendor: &str,
    device_type: &str,
    now: &str,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO devices (ip_address, mac_address, hostname, vendor, device_type, first_seen, last_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![ip_address, mac_address, hostname, vendor, device_type, now],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Update a matched device from a fresh scan result. Hostname is only
/// overwritten when the scan actually provided one.
pub fn update_device_seen(
    conn: &Connection,
    device_id: i64,
    ip_address: &str,
    mac_address: Option<&str>,
    hostname: Option<&str>,
    now: &str,
) -> Result<(), rusqlite::Error> {
    match hostname {
        Some(host) => {
            conn.execute(
                "UPDATE devices SET ip_address = ?1, mac_address = ?2, hostname = ?3, last_seen = ?4
                 WHERE id = ?5",
                params![ip_address, mac_address, host, now, device_id],
            )?;
        }
        None => {
            conn.execute(
                "UPDATE devices SET ip_address = ?1, mac_address = ?2, last_seen = ?3 WHERE id = ?4",
                params![ip_address, mac_address, now, device_id],
            )?;
        }
    }
    Ok(())
}

pub fn update_vendor_and_type(
    conn: &Connection,
    device_id: i64,
    vendor: &str,
    device_type: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE devices SET vendor = ?1, device_type = ?2 WHERE id = ?3",
        params![vendor, device_type, device_id],
    )?;
    Ok(())
}

pub fn update_enrichment(
    conn: &Connection,
    device_id: i64,
    hostname: Option<&str>,
    model_name: Option<&str>,
    vendor: Option<&str>,
    area: Option<&str>,
    now: &str,
) -> Result<(), rusqlite::Error> {
    if let Some(host) = hostname {
        conn.execute(
            "UPDATE devices SET hostname = ?1 WHERE id = ?2",
            params![host, device_id],
        )?;
    }
    if let Some(model) = model_name {
        conn.execute(
            "UPDATE devices SET model_name = ?1 WHERE id = ?2",
            params![model, device_id],
        )?;
    }
    if let Some(v) = vendor {
        conn.execute(
            "UPDATE devices SET vendor = ?1 WHERE id = ?2",
            params![v, device_id],
        )?;
    }
    if let Some(a) = area {
        conn.execute(
            "UPDATE devices SET area = ?1 WHERE id = ?2",
            params![a, device_id],
        )?;
    }
    conn.execute(
        "UPDATE devices SET last_seen = ?1 WHERE id = ?2",
        params![now, device_id],
    )?;
    Ok(())
}

pub fn touch_device(conn: &Connection, device_id: i64, now: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE devices SET last_seen = ?1 WHERE id = ?2",
        params![now, device_id],
    )?;
    Ok(())
}

pub fn get_custom_name(
    conn: &Connection,
    device_id: i64,
) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT custom_name FROM devices WHERE id = ?1",
        [device_id],
        |row| row.get(0),
    )
    .optional()
    .map(|opt| opt.flatten())
}

pub fn set_custom_name(
    conn: &Connection,
    device_id: i64,
    custom_name: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE devices SET custom_name = ?1 WHERE id = ?2",
        params![custom_name, device_id],
    )?;
    Ok(())
}

pub fn get_trust_status(conn: &Connection, device_id: i64) -> Result<String, rusqlite::Error> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM device_trust WHERE device_id = ?1",
            [device_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(status.unwrap_or_else(|| "unknown".to_string()))
}

pub fn set_trust_status(
    conn: &Connection,
    device_id: i64,
    status: &str,
    now: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO device_trust (device_id, status, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(device_id) DO UPDATE SET status = excluded.status,
                                              updated_at = excluded.updated_at",
        params![device_id, status, now],
    )?;
    Ok(())
}

/// Load every device with its latest fingerprint snapshot.
pub fn load_all_with_fingerprints(
    conn: &Connection,
) -> Result<Vec<DeviceWithFingerprint>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT d.id, d.ip_address, d.mac_address, d.hostname, d.vendor, d.device_type,
                d.model_name, d.area, d.first_seen, d.last_seen,
                fp.mdns_hostname, fp.dhcp_fingerprint_hash,
                fp.connection_pattern_hash, fp.open_ports_hash
         FROM devices d
         LEFT JOIN device_fingerprints fp ON fp.device_id = d.id
            AND fp.id = (SELECT MAX(fp2.id) FROM device_fingerprints fp2
                         WHERE fp2.device_id = d.id)",
    )?;

    let rows = stmt.query_map([], |row| {
        Ok(DeviceWithFingerprint {
            id: row.get(0)?,
            ip_address: row.get(1)?,
            mac_address: row.get(2)?,
            hostname: row.get(3)?,
            vendor: row.get(4)?,
            device_type: row.get(5)?,
            model_name: row.get(6)?,
            area: row.get(7)?,
            first_seen: row.get(8)?,
            last_seen: row.get(9)?,
            fp_mdns_hostname: row.get(10)?,
            fp_dhcp_hash: row.get(11)?,
            fp_connection_hash: row.get(12)?,
            fp_open_ports_hash: row.get(13)?,
        })
    })?;

    rows.collect()
}

pub fn get_device_type_and_hostname(
    conn: &Connection,
    device_id: i64,
) -> Result<Option<(String, Option<String>)>, rusqlite::Error> {
    conn.query_row(
        "SELECT device_type, hostname FROM devices WHERE id = ?1",
        [device_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
}

// ---------------------------------------------------------------------------
// Open ports
// ---------------------------------------------------------------------------

/// Upsert an observed open port, preserving prior service/banner data when
/// the new scan did not capture any (COALESCE).
pub fn upsert_open_port(
    conn: &Connection,
    device_id: i64,
    port: u16,
    service_name: Option<&str>,
    banner: Option<&str>,
    now: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO device_open_ports
            (device_id, port, protocol, service_name, banner, first_seen, last_seen)
         VALUES (?1, ?2, 'tcp', ?3, ?4, ?5, ?5)
         ON CONFLICT(device_id, port, protocol) DO UPDATE SET
            last_seen = excluded.last_seen,
            service_name = COALESCE(excluded.service_name, device_open_ports.service_name),
            banner = COALESCE(excluded.banner, device_open_ports.banner)",
        params![device_id, port, service_name, banner, now],
    )?;
    Ok(())
}

pub fn get_open_ports(conn: &Connection, device_id: i64) -> Result<Vec<u16>, rusqlite::Error> {
    let mut stmt =
        conn.prepare("SELECT port FROM device_open_ports WHERE device_id = ?1 ORDER BY port")?;
    let ports = stmt.query_map([device_id], |row| row.get::<_, u16>(0))?;
    ports.collect()
}

// ---------------------------------------------------------------------------
// Connection baselines
// ---------------------------------------------------------------------------

pub fn upsert_baseline_connection(
    conn: &Connection,
    device_id: i64,
    dest_ip: &str,
    dest_port: u16,
    now: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO connection_baselines (device_id, dest_ip, dest_port, first_seen, last_seen)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT(device_id, dest_ip, dest_port)
         DO UPDATE SET hit_count = hit_count + 1, last_seen = excluded.last_seen",
        params![device_id, dest_ip, dest_port, now],
    )?;
    Ok(())
}

/// Baseline destinations as "ip:port" strings, matching the fingerprint
/// connection-set representation.
pub fn get_baseline_destinations(
    conn: &Connection,
    device_id: i64,
) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT dest_ip, dest_port FROM connection_baselines WHERE device_id = ?1",
    )?;
    let rows = stmt.query_map([device_id], |row| {
        let ip: String = row.get(0)?;
        let port: u16 = row.get(1)?;
        Ok(format!("{ip}:{port}"))
    })?;
    rows.collect()
}
