use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Complete service fingerprint for one device+port, as captured by the
/// scout engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceProfile {
    pub device_id: i64,
    pub ip_address: String,
    pub port: u16,
    pub protocol: String,
    pub service_name: Option<String>,
    pub http_status: Option<u16>,
    pub http_headers: Option<HashMap<String, String>>,
    pub http_body_snippet: Option<String>,
    pub http_server_header: Option<String>,
    pub favicon_hash: Option<String>,
    pub tls_cn: Option<String>,
    pub tls_issuer: Option<String>,
    pub tls_not_after: Option<String>,
    pub protocol_version: Option<String>,
    pub scouted_at: String,
}

#[derive(Debug, Clone)]
pub struct MimicTemplateRow {
    pub id: i64,
    pub source_device_id: i64,
    pub source_ip: String,
    pub device_category: String,
    pub routes_json: String,
    pub server_header: Option<String>,
    pub credential_types_json: String,
    pub mdns_service_type: Option<String>,
    pub mdns_name: Option<String>,
}

const PROFILE_COLUMNS: &str = "device_id, ip_address, port, protocol, service_name, http_status, \
     http_headers, http_body_snippet, http_server_header, favicon_hash, tls_cn, tls_issuer, \
     tls_not_after, protocol_version, scouted_at";

fn row_to_profile(row: &rusqlite::Row<'_>) -> Result<ServiceProfile, rusqlite::Error> {
    let headers_raw: Option<String> = row.get(6)?;
    Ok(ServiceProfile {
        device_id: row.get(0)?,
        ip_address: row.get(1)?,
        port: row.get(2)?,
        protocol: row.get(3)?,
        service_name: row.get(4)?,
        http_status: row.get(5)?,
        http_headers: headers_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        http_body_snippet: row.get(7)?,
        http_server_header: row.get(8)?,
        favicon_hash: row.get(9)?,
        tls_cn: row.get(10)?,
        tls_issuer: row.get(11)?,
        tls_not_after: row.get(12)?,
        protocol_version: row.get(13)?,
        scouted_at: row.get(14)?,
    })
}

/// Upsert a profile keyed on (device_id, port, protocol). A probe that
/// captured nothing for a field must not wipe a previously captured
/// value, hence COALESCE on every data column.
pub fn upsert_profile(conn: &Connection, profile: &ServiceProfile) -> Result<(), rusqlite::Error> {
    let headers_json = profile
        .http_headers
        .as_ref()
        .map(|headers| serde_json::to_string(headers).unwrap_or_default());

    conn.execute(
        "INSERT INTO service_profiles
            (device_id, ip_address, port, protocol, service_name, http_status, http_headers,
             http_body_snippet, http_server_header, favicon_hash, tls_cn, tls_issuer,
             tls_not_after, protocol_version, scouted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(device_id, port, protocol) DO UPDATE SET
            ip_address = excluded.ip_address,
            service_name = COALESCE(excluded.service_name, service_profiles.service_name),
            http_status = COALESCE(excluded.http_status, service_profiles.http_status),
            http_headers = COALESCE(excluded.http_headers, service_profiles.http_headers),
            http_body_snippet = COALESCE(excluded.http_body_snippet, service_profiles.http_body_snippet),
            http_server_header = COALESCE(excluded.http_server_header, service_profiles.http_server_header),
            favicon_hash = COALESCE(excluded.favicon_hash, service_profiles.favicon_hash),
            tls_cn = COALESCE(excluded.tls_cn, service_profiles.tls_cn),
            tls_issuer = COALESCE(excluded.tls_issuer, service_profiles.tls_issuer),
            tls_not_after = COALESCE(excluded.tls_not_after, service_profiles.tls_not_after),
            protocol_version = COALESCE(excluded.protocol_version, service_profiles.protocol_version),
            scouted_at = excluded.scouted_at",
        params![
            profile.device_id,
            profile.ip_address,
            profile.port,
            profile.protocol,
            profile.service_name,
            profile.http_status,
            headers_json,
            profile.http_body_snippet,
            profile.http_server_header,
            profile.favicon_hash,
            profile.tls_cn,
            profile.tls_issuer,
            profile.tls_not_after,
            profile.protocol_version,
            profile.scouted_at
        ],
    )?;
    Ok(())
}

pub fn get_profiles_for_device(
    conn: &Connection,
    device_id: i64,
) -> Result<Vec<ServiceProfile>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROFILE_COLUMNS} FROM service_profiles WHERE device_id = ?1 ORDER BY port"
    ))?;
    let rows = stmt.query_map([device_id], |row| row_to_profile(row))?;
    rows.collect()
}

/// Profiles worth mimicking: HTTP data present, ordered by device-type
/// preference (smart home and cameras make the most convincing mimics),
/// then by port.
pub fn get_mimic_candidates(
    conn: &Connection,
    count: usize,
) -> Result<Vec<ServiceProfile>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT sp.device_id, sp.ip_address, sp.port, sp.protocol, sp.service_name,
                sp.http_status, sp.http_headers, sp.http_body_snippet, sp.http_server_header,
                sp.favicon_hash, sp.tls_cn, sp.tls_issuer, sp.tls_not_after,
                sp.protocol_version, sp.scouted_at
         FROM service_profiles sp
         JOIN devices d ON d.id = sp.device_id
         WHERE sp.http_status IS NOT NULL
         ORDER BY
            CASE d.device_type
                WHEN 'smart_home' THEN 0
                WHEN 'camera' THEN 1
                WHEN 'media' THEN 2
                WHEN 'printer' THEN 3
                ELSE 4
            END,
            sp.port
         LIMIT {count}"
    ))?;
    let rows = stmt.query_map([], |row| row_to_profile(row))?;
    rows.collect()
}

pub fn insert_template(
    conn: &Connection,
    source_device_id: i64,
    source_ip: &str,
    device_category: &str,
    routes_json: &str,
    server_header: Option<&str>,
    credential_types_json: &str,
    mdns_service_type: Option<&str>,
    mdns_name: Option<&str>,
    now: &str,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO mimic_templates
            (source_device_id, source_ip, device_category, routes_json, server_header,
             credential_types_json, mdns_service_type, mdns_name, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            source_device_id,
            source_ip,
            device_category,
            routes_json,
            server_header,
            credential_types_json,
            mdns_service_type,
            mdns_name,
            now
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_template(
    conn: &Connection,
    template_id: i64,
) -> Result<Option<MimicTemplateRow>, rusqlite::Error> {
    conn.query_row(
        "SELECT id, source_device_id, source_ip, device_category, routes_json, server_header,
                credential_types_json, mdns_service_type, mdns_name
         FROM mimic_templates WHERE id = ?1",
        [template_id],
        |row| {
            Ok(MimicTemplateRow {
                id: row.get(0)?,
                source_device_id: row.get(1)?,
                source_ip: row.get(2)?,
                device_category: row.get(3)?,
                routes_json: row.get(4)?,
                server_header: row.get(5)?,
                credential_types_json: row.get(6)?,
                mdns_service_type: row.get(7)?,
                mdns_name: row.get(8)?,
            })
        },
    )
    .optional()
}

pub fn get_template_source(
    conn: &Connection,
    template_id: i64,
) -> Result<Option<i64>, rusqlite::Error> {
    conn.query_row(
        "SELECT source_device_id FROM mimic_templates WHERE id = ?1",
        [template_id],
        |row| row.get(0),
    )
    .optional()
}
