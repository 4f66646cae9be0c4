use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::db::queries::{devices as db_devices, fingerprints as db_fingerprints};
use crate::db::DbPool;
use crate::devices::classifier::DeviceClassifier;
use crate::error::Result;
use crate::events::{types, EventBus};
use crate::fingerprint::composite::{compute_fingerprint, CompositeFingerprint};
use crate::fingerprint::matcher::{
    match_device, KnownDevice, AUTO_APPROVE_THRESHOLD, VERIFY_THRESHOLD,
};
use crate::integrations::home_assistant::{HaArea, HaDevice};
use crate::scanner::port::PortScanResult;
use crate::timefmt;

/// Raw scan result from the network scanner. Everything except the IP is
/// optional; the pipeline copes with partial data.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub ip_address: String,
    pub mac_address: Option<String>,
    pub hostname: Option<String>,
    pub mdns_hostname: Option<String>,
    pub open_ports: Option<Vec<u16>>,
    pub dhcp_options: Option<Vec<u8>>,
    pub connections: Option<Vec<(String, u16)>>,
}

impl ScanResult {
    pub fn new(ip: &str, mac: &str) -> Self {
        Self {
            ip_address: ip.to_string(),
            mac_address: Some(mac.to_string()),
            ..Default::default()
        }
    }
}

/// In-memory representation of a known device.
#[derive(Debug, Clone)]
pub struct TrackedDevice {
    pub device_id: i64,
    pub ip_address: String,
    pub mac_address: Option<String>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub device_type: String,
    pub model_name: Option<String>,
    pub area: Option<String>,
    pub fingerprint: CompositeFingerprint,
    pub connection_destinations: BTreeSet<String>,
    pub open_ports: BTreeSet<u16>,
    pub first_seen: String,
    pub last_seen: String,
}

/// Orchestrates the device identification pipeline:
/// scan result -> fingerprint -> match -> classify -> persist -> publish.
///
/// The in-memory known-device list is only mutated from the scan loop's
/// task; readers get copies via `get_known_devices`.
pub struct DeviceManager {
    pool: DbPool,
    bus: Arc<EventBus>,
    classifier: DeviceClassifier,
    known: Mutex<Vec<TrackedDevice>>,
}

impl DeviceManager {
    pub fn new(pool: DbPool, bus: Arc<EventBus>, classifier: DeviceClassifier) -> Self {
        Self {
            pool,
            bus,
            classifier,
            known: Mutex::new(Vec::new()),
        }
    }

    /// Load previously-discovered devices so the matcher can recognise
    /// returning devices across restarts. Devices whose stored vendor is
    /// Unknown are re-run through local classification (the signature DB
    /// may have grown since they were first seen).
    pub async fn load_known_devices(&self) -> Result<()> {
        let loaded = {
            let conn = self.pool.get()?;
            let rows = db_devices::load_all_with_fingerprints(&conn)?;

            let mut loaded = Vec::with_capacity(rows.len());
            for row in rows {
                let fingerprint = CompositeFingerprint::from_stored(
                    row.mac_address.clone(),
                    row.fp_mdns_hostname,
                    row.fp_dhcp_hash,
                    row.fp_connection_hash,
                    row.fp_open_ports_hash,
                );
                let connection_destinations: BTreeSet<String> =
                    db_devices::get_baseline_destinations(&conn, row.id)?
                        .into_iter()
                        .collect();
                let open_ports: BTreeSet<u16> =
                    db_devices::get_open_ports(&conn, row.id)?.into_iter().collect();

                loaded.push(TrackedDevice {
                    device_id: row.id,
                    ip_address: row.ip_address,
                    mac_address: row.mac_address,
                    hostname: row.hostname,
                    vendor: row.vendor,
                    device_type: row.device_type,
                    model_name: row.model_name,
                    area: row.area,
                    fingerprint,
                    connection_destinations,
                    open_ports,
                    first_seen: row.first_seen,
                    last_seen: row.last_seen,
                });
            }
            loaded
        };

        let count = loaded.len();
        *self.known.lock().unwrap() = loaded;
        log::info!("Loaded {count} known devices from database");

        self.reclassify_unknown_vendors().await?;
        Ok(())
    }

    async fn reclassify_unknown_vendors(&self) -> Result<()> {
        let candidates: Vec<(i64, String)> = {
            let known = self.known.lock().unwrap();
            known
                .iter()
                .filter(|td| td.vendor.as_deref() == Some("Unknown"))
                .filter_map(|td| td.mac_address.clone().map(|mac| (td.device_id, mac)))
                .collect()
        };

        let mut reclassified = 0usize;
        for (device_id, mac) in candidates {
            let fp = compute_fingerprint(Some(&mac), None, None, None, None);
            let classification = self.classifier.classify(&fp).await;
            if classification.manufacturer == "Unknown" {
                continue;
            }
            {
                let conn = self.pool.get()?;
                db_devices::update_vendor_and_type(
                    &conn,
                    device_id,
                    &classification.manufacturer,
                    &classification.device_type,
                )?;
            }
            let mut known = self.known.lock().unwrap();
            if let Some(td) = known.iter_mut().find(|td| td.device_id == device_id) {
                td.vendor = Some(classification.manufacturer.clone());
                td.device_type = classification.device_type.clone();
            }
            reclassified += 1;
        }
        if reclassified > 0 {
            log::info!("Reclassified {reclassified} devices with updated signature DB");
        }
        Ok(())
    }

    /// Snapshot of all known devices.
    pub fn get_known_devices(&self) -> Vec<TrackedDevice> {
        self.known.lock().unwrap().clone()
    }

    /// Process a single scan result through the full pipeline.
    pub async fn process_scan_result(&self, scan: &ScanResult) -> Result<()> {
        let now = timefmt::now_iso();

        let fp = compute_fingerprint(
            scan.mac_address.as_deref(),
            scan.mdns_hostname.as_deref(),
            scan.dhcp_options.as_deref(),
            scan.connections.as_deref(),
            scan.open_ports.as_deref(),
        );

        let conn_dests: BTreeSet<String> = scan
            .connections
            .iter()
            .flatten()
            .map(|(ip, port)| format!("{ip}:{port}"))
            .collect();
        let ports_set: BTreeSet<u16> = scan.open_ports.iter().flatten().copied().collect();

        // Stage 2: match. Fast path first; a direct MAC hit covers
        // ARP-only scans where the multi-signal matcher has nothing else
        // to work with.
        let (matched_id, confidence) = {
            let known = self.known.lock().unwrap();

            let mac_hit = fp.mac_address.as_deref().and_then(|mac| {
                known
                    .iter()
                    .find(|td| {
                        td.mac_address
                            .as_deref()
                            .is_some_and(|m| m.eq_ignore_ascii_case(mac))
                    })
                    .map(|td| td.device_id)
            });

            match mac_hit {
                Some(id) => (Some(id), AUTO_APPROVE_THRESHOLD),
                None => {
                    let snapshot: Vec<KnownDevice> = known
                        .iter()
                        .map(|td| KnownDevice {
                            device_id: td.device_id,
                            fingerprint: td.fingerprint.clone(),
                            connection_destinations: td.connection_destinations.clone(),
                            open_ports: td.open_ports.clone(),
                        })
                        .collect();
                    match_device(&fp, &snapshot, &conn_dests, &ports_set)
                }
            }
        };

        match matched_id {
            Some(device_id) => {
                self.handle_matched_device(device_id, confidence, scan, fp, conn_dests, ports_set, &now)
                    .await
            }
            None => {
                self.handle_new_device(scan, fp, conn_dests, ports_set, &now)
                    .await
            }
        }
    }

    async fn handle_new_device(
        &self,
        scan: &ScanResult,
        fp: CompositeFingerprint,
        conn_dests: BTreeSet<String>,
        ports_set: BTreeSet<u16>,
        now: &str,
    ) -> Result<()> {
        let classification = self.classifier.classify(&fp).await;

        let device_id = {
            let conn = self.pool.get()?;
            let device_id = db_devices::insert_device(
                &conn,
                &scan.ip_address,
                fp.mac_address.as_deref(),
                scan.hostname.as_deref(),
                &classification.manufacturer,
                &classification.device_type,
                now,
            )?;
            db_fingerprints::insert_fingerprint(
                &conn,
                device_id,
                &fp,
                Some(classification.confidence),
                now,
            )?;
            self.persist_connections(&conn, device_id, scan, now)?;
            device_id
        };

        let tracked = TrackedDevice {
            device_id,
            ip_address: scan.ip_address.clone(),
            mac_address: fp.mac_address.clone(),
            hostname: scan.hostname.clone(),
            vendor: Some(classification.manufacturer),
            device_type: classification.device_type,
            model_name: None,
            area: None,
            fingerprint: fp,
            connection_destinations: conn_dests,
            open_ports: ports_set,
            first_seen: now.to_string(),
            last_seen: now.to_string(),
        };
        let payload = self.build_device_payload(&tracked)?;
        self.known.lock().unwrap().push(tracked);

        self.bus
            .publish(types::DEVICE_NEW, payload, Some(&device_id.to_string()))
            .await?;
        Ok(())
    }

    async fn handle_matched_device(
        &self,
        device_id: i64,
        confidence: f64,
        scan: &ScanResult,
        fp: CompositeFingerprint,
        conn_dests: BTreeSet<String>,
        ports_set: BTreeSet<u16>,
        now: &str,
    ) -> Result<()> {
        let new_mac = fp.mac_address.clone();

        let (old_mac, snapshot) = {
            let mut known = self.known.lock().unwrap();
            let Some(tracked) = known.iter_mut().find(|td| td.device_id == device_id) else {
                return Ok(());
            };

            let old_mac = tracked.mac_address.clone();
            tracked.ip_address = scan.ip_address.clone();
            if scan.hostname.is_some() {
                tracked.hostname = scan.hostname.clone();
            }
            tracked.fingerprint = fp.clone();
            if !conn_dests.is_empty() {
                tracked.connection_destinations = conn_dests;
            }
            if !ports_set.is_empty() {
                tracked.open_ports = ports_set;
            }
            tracked.last_seen = now.to_string();
            if new_mac.is_some() {
                tracked.mac_address = new_mac.clone();
            }
            (old_mac, tracked.clone())
        };

        {
            let conn = self.pool.get()?;
            db_devices::update_device_seen(
                &conn,
                device_id,
                &scan.ip_address,
                fp.mac_address.as_deref(),
                scan.hostname.as_deref(),
                now,
            )?;
            db_fingerprints::insert_fingerprint(&conn, device_id, &fp, Some(confidence), now)?;
            self.persist_connections(&conn, device_id, scan, now)?;
        }

        let source = device_id.to_string();
        if let (Some(old), Some(new)) = (&old_mac, &new_mac) {
            if !old.eq_ignore_ascii_case(new) {
                self.bus
                    .publish(
                        types::DEVICE_MAC_CHANGED,
                        json!({
                            "device_id": device_id,
                            "old_mac": old,
                            "new_mac": new,
                            "confidence": confidence,
                        }),
                        Some(&source),
                    )
                    .await?;
            }
        }

        let payload = self.build_device_payload(&snapshot)?;
        if confidence >= AUTO_APPROVE_THRESHOLD {
            self.bus
                .publish(types::DEVICE_UPDATED, payload, Some(&source))
                .await?;
        } else if confidence >= VERIFY_THRESHOLD {
            self.bus
                .publish(types::DEVICE_VERIFICATION_NEEDED, payload, Some(&source))
                .await?;
        } else {
            // Low confidence; treated as updated but flagged for clients.
            let mut flagged = payload;
            flagged["low_confidence"] = json!(true);
            self.bus
                .publish(types::DEVICE_UPDATED, flagged, Some(&source))
                .await?;
        }
        Ok(())
    }

    fn persist_connections(
        &self,
        conn: &rusqlite::Connection,
        device_id: i64,
        scan: &ScanResult,
        now: &str,
    ) -> Result<()> {
        for (dest_ip, dest_port) in scan.connections.iter().flatten() {
            db_devices::upsert_baseline_connection(conn, device_id, dest_ip, *dest_port, now)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Enrichment (Phase 2/3). All of these are no-ops for unknown IPs
    // and never create devices.
    // -----------------------------------------------------------------

    /// Enrich a known device with open-port data from a Phase-2 port scan.
    pub async fn enrich_device_ports(
        &self,
        ip_address: &str,
        port_results: &[PortScanResult],
    ) -> Result<()> {
        let now = timefmt::now_iso();
        let port_numbers: Vec<u16> = port_results.iter().map(|r| r.port).collect();
        let ports_set: BTreeSet<u16> = port_numbers.iter().copied().collect();

        let (device_id, fp, ports_unchanged) = {
            let mut known = self.known.lock().unwrap();
            let Some(tracked) = known.iter_mut().find(|td| td.ip_address == ip_address) else {
                return Ok(());
            };

            let unchanged = ports_set == tracked.open_ports;
            if unchanged {
                (tracked.device_id, None, true)
            } else {
                tracked.open_ports = ports_set;
                tracked.last_seen = now.clone();
                let fp = compute_fingerprint(
                    tracked.mac_address.as_deref(),
                    tracked.fingerprint.mdns_hostname.as_deref(),
                    None,
                    None,
                    Some(&port_numbers),
                );
                tracked.fingerprint = fp.clone();
                (tracked.device_id, Some(fp), false)
            }
        };

        {
            let conn = self.pool.get()?;
            // Always persist port rows: even with an unchanged port set the
            // scan may carry fresh service names or banners.
            for result in port_results {
                db_devices::upsert_open_port(
                    &conn,
                    device_id,
                    result.port,
                    result.service_name.as_deref(),
                    result.banner.as_deref(),
                    &now,
                )?;
            }
            if let Some(fp) = &fp {
                db_fingerprints::insert_fingerprint(&conn, device_id, fp, None, &now)?;
                db_devices::touch_device(&conn, device_id, &now)?;
            }
        }

        if ports_unchanged {
            return Ok(());
        }

        let snapshot = self.snapshot_device(device_id);
        if let Some(tracked) = snapshot {
            let payload = self.build_device_payload(&tracked)?;
            self.bus
                .publish(types::DEVICE_UPDATED, payload, Some(&device_id.to_string()))
                .await?;
        }
        Ok(())
    }

    /// Enrich a known device with mDNS/SSDP discovery data.
    ///
    /// Priority rules: mDNS hostname wins over UPnP friendly name; UPnP
    /// manufacturer only overwrites an Unknown vendor; custom_name is
    /// never touched; enrichment is additive.
    pub async fn enrich_device_discovery(
        &self,
        ip_address: &str,
        mdns_hostname: Option<&str>,
        upnp_friendly_name: Option<&str>,
        upnp_manufacturer: Option<&str>,
        upnp_model_name: Option<&str>,
    ) -> Result<()> {
        let now = timefmt::now_iso();

        let update = {
            let mut known = self.known.lock().unwrap();
            let Some(tracked) = known.iter_mut().find(|td| td.ip_address == ip_address) else {
                return Ok(());
            };

            let mut changed = false;

            let new_hostname = mdns_hostname.or(upnp_friendly_name);
            if let Some(host) = new_hostname {
                if tracked.hostname.as_deref() != Some(host) {
                    tracked.hostname = Some(host.to_string());
                    changed = true;
                }
            }

            if let Some(model) = upnp_model_name {
                tracked.model_name = Some(model.to_string());
                changed = true;
            }

            let vendor_update = if upnp_manufacturer.is_some()
                && tracked.vendor.as_deref() == Some("Unknown")
            {
                tracked.vendor = upnp_manufacturer.map(str::to_string);
                changed = true;
                upnp_manufacturer
            } else {
                None
            };

            if !changed {
                return Ok(());
            }

            tracked.last_seen = now.clone();
            let ports_vec: Vec<u16> = tracked.open_ports.iter().copied().collect();
            let fp = compute_fingerprint(
                tracked.mac_address.as_deref(),
                mdns_hostname.or(tracked.fingerprint.mdns_hostname.as_deref()),
                None,
                None,
                if ports_vec.is_empty() { None } else { Some(&ports_vec) },
            );
            tracked.fingerprint = fp.clone();

            Some((
                tracked.device_id,
                tracked.hostname.clone(),
                upnp_model_name.map(str::to_string),
                vendor_update.map(str::to_string),
                fp,
                tracked.clone(),
            ))
        };

        let Some((device_id, hostname, model, vendor, fp, snapshot)) = update else {
            return Ok(());
        };

        {
            let conn = self.pool.get()?;
            db_devices::update_enrichment(
                &conn,
                device_id,
                hostname.as_deref(),
                model.as_deref(),
                vendor.as_deref(),
                None,
                &now,
            )?;
            db_fingerprints::insert_fingerprint(&conn, device_id, &fp, None, &now)?;
        }

        let payload = self.build_device_payload(&snapshot)?;
        self.bus
            .publish(types::DEVICE_UPDATED, payload, Some(&device_id.to_string()))
            .await?;
        Ok(())
    }

    /// Enrich tracked devices with Home Assistant registry data, matching
    /// by MAC address (case-insensitive).
    pub async fn enrich_device_ha(&self, ha_devices: &[HaDevice], ha_areas: &[HaArea]) -> Result<()> {
        let area_map: std::collections::HashMap<&str, &str> = ha_areas
            .iter()
            .map(|area| (area.id.as_str(), area.name.as_str()))
            .collect();

        let mut mac_to_ha: std::collections::HashMap<String, &HaDevice> =
            std::collections::HashMap::new();
        for device in ha_devices {
            for mac in &device.mac_addresses {
                mac_to_ha.insert(mac.to_lowercase(), device);
            }
        }

        let tracked_macs: Vec<(i64, String)> = {
            let known = self.known.lock().unwrap();
            known
                .iter()
                .filter_map(|td| td.mac_address.clone().map(|mac| (td.device_id, mac)))
                .collect()
        };

        for (device_id, mac) in tracked_macs {
            let Some(ha_dev) = mac_to_ha.get(&mac.to_lowercase()) else {
                continue;
            };

            let has_custom_name = {
                let conn = self.pool.get()?;
                db_devices::get_custom_name(&conn, device_id)?.is_some()
            };

            let now = timefmt::now_iso();
            let area_name = ha_dev
                .area_id
                .as_deref()
                .and_then(|id| area_map.get(id))
                .map(|s| s.to_string());

            let update = {
                let mut known = self.known.lock().unwrap();
                let Some(tracked) = known.iter_mut().find(|td| td.device_id == device_id) else {
                    continue;
                };

                let mut changed = false;

                if let Some(name) = &ha_dev.name {
                    if !has_custom_name && !name.is_empty() {
                        tracked.hostname = Some(name.clone());
                        changed = true;
                    }
                }
                if let Some(model) = &ha_dev.model {
                    tracked.model_name = Some(model.clone());
                    changed = true;
                }
                let vendor_update = if ha_dev.manufacturer.is_some()
                    && tracked.vendor.as_deref() == Some("Unknown")
                {
                    tracked.vendor = ha_dev.manufacturer.clone();
                    changed = true;
                    ha_dev.manufacturer.clone()
                } else {
                    None
                };
                if area_name != tracked.area {
                    tracked.area = area_name.clone();
                    changed = true;
                }

                if !changed {
                    None
                } else {
                    tracked.last_seen = now.clone();
                    let ports_vec: Vec<u16> = tracked.open_ports.iter().copied().collect();
                    let fp = compute_fingerprint(
                        tracked.mac_address.as_deref(),
                        tracked.fingerprint.mdns_hostname.as_deref(),
                        None,
                        None,
                        if ports_vec.is_empty() { None } else { Some(&ports_vec) },
                    );
                    tracked.fingerprint = fp.clone();
                    Some((
                        tracked.hostname.clone(),
                        tracked.model_name.clone(),
                        vendor_update,
                        fp,
                        tracked.clone(),
                    ))
                }
            };

            let Some((hostname, model, vendor, fp, snapshot)) = update else {
                continue;
            };

            {
                let conn = self.pool.get()?;
                db_devices::update_enrichment(
                    &conn,
                    device_id,
                    hostname.as_deref(),
                    model.as_deref(),
                    vendor.as_deref(),
                    snapshot.area.as_deref(),
                    &now,
                )?;
                db_fingerprints::insert_fingerprint(&conn, device_id, &fp, None, &now)?;
            }

            let payload = self.build_device_payload(&snapshot)?;
            self.bus
                .publish(types::DEVICE_UPDATED, payload, Some(&device_id.to_string()))
                .await?;
        }
        Ok(())
    }

    fn snapshot_device(&self, device_id: i64) -> Option<TrackedDevice> {
        self.known
            .lock()
            .unwrap()
            .iter()
            .find(|td| td.device_id == device_id)
            .cloned()
    }

    /// Full device summary for event payloads. Trust status and custom
    /// name come from the database so payloads always reflect persisted
    /// state.
    fn build_device_payload(&self, tracked: &TrackedDevice) -> Result<serde_json::Value> {
        let conn = self.pool.get()?;
        let trust_status = db_devices::get_trust_status(&conn, tracked.device_id)?;
        let custom_name = db_devices::get_custom_name(&conn, tracked.device_id)?;

        Ok(json!({
            "id": tracked.device_id,
            "ip_address": tracked.ip_address,
            "mac_address": tracked.mac_address,
            "hostname": tracked.hostname,
            "vendor": tracked.vendor,
            "device_type": tracked.device_type,
            "model_name": tracked.model_name,
            "custom_name": custom_name,
            "area": tracked.area,
            "trust_status": trust_status,
            "is_online": true,
            "first_seen": tracked.first_seen,
            "last_seen": tracked.last_seen,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::devices::signatures::SignatureDb;
    use crate::events::EventLog;

    fn manager() -> (Arc<DeviceManager>, Arc<EventBus>, DbPool) {
        let pool = db::init_test_db();
        let bus = Arc::new(EventBus::new(EventLog::new(pool.clone())));
        let classifier = DeviceClassifier::new(SignatureDb::bundled(), None);
        (
            Arc::new(DeviceManager::new(pool.clone(), bus.clone(), classifier)),
            bus,
            pool,
        )
    }

    fn events_of_type(bus: &EventBus, event_type: &str) -> Vec<crate::events::Event> {
        bus.replay(0)
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    #[tokio::test]
    async fn test_new_device_flow() {
        let (manager, bus, pool) = manager();

        let scan = ScanResult {
            ip_address: "192.168.1.100".to_string(),
            mac_address: Some("A4:83:E7:11:22:33".to_string()),
            open_ports: Some(vec![22, 80, 443]),
            ..Default::default()
        };
        manager.process_scan_result(&scan).await.unwrap();

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let vendor: String = conn
            .query_row("SELECT vendor FROM devices", [], |row| row.get(0))
            .unwrap();
        assert_eq!(vendor, "Apple");
        let device_type: String = conn
            .query_row("SELECT device_type FROM devices", [], |row| row.get(0))
            .unwrap();
        assert_eq!(device_type, "computer");

        let new_events = events_of_type(&bus, "device.new");
        assert_eq!(new_events.len(), 1);
        assert_eq!(
            new_events[0].payload["mac_address"].as_str(),
            Some("A4:83:E7:11:22:33")
        );

        let fp_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM device_fingerprints", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fp_count, 1);
    }

    #[tokio::test]
    async fn test_same_scan_twice_is_idempotent_on_devices() {
        let (manager, bus, pool) = manager();

        let scan = ScanResult::new("192.168.1.100", "A4:83:E7:11:22:33");
        manager.process_scan_result(&scan).await.unwrap();
        manager.process_scan_result(&scan).await.unwrap();

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        // Fingerprint history grows by exactly one per scan.
        let fp_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM device_fingerprints", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fp_count, 2);

        assert_eq!(events_of_type(&bus, "device.new").len(), 1);
        assert_eq!(events_of_type(&bus, "device.updated").len(), 1);
    }

    #[tokio::test]
    async fn test_mac_change_flow() {
        let (manager, bus, pool) = manager();

        // Register with rich signals.
        let original = ScanResult {
            ip_address: "192.168.1.50".to_string(),
            mac_address: Some("A4:83:E7:11:22:33".to_string()),
            mdns_hostname: Some("macbook-pro".to_string()),
            dhcp_options: Some(vec![1, 3, 6, 15, 28, 51, 53]),
            connections: Some(vec![("8.8.8.8".to_string(), 443)]),
            ..Default::default()
        };
        manager.process_scan_result(&original).await.unwrap();

        // Re-scan with a randomized MAC but identical other signals.
        let randomized = ScanResult {
            mac_address: Some("11:22:33:44:55:66".to_string()),
            ..original.clone()
        };
        manager.process_scan_result(&randomized).await.unwrap();

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1, "no new device row for a MAC change");

        let mac_events = events_of_type(&bus, "device.mac_changed");
        assert_eq!(mac_events.len(), 1);
        assert_eq!(
            mac_events[0].payload["old_mac"].as_str(),
            Some("A4:83:E7:11:22:33")
        );
        assert_eq!(
            mac_events[0].payload["new_mac"].as_str(),
            Some("11:22:33:44:55:66")
        );
        assert_eq!(events_of_type(&bus, "device.updated").len(), 1);
    }

    #[tokio::test]
    async fn test_single_signal_match_needs_verification() {
        let (manager, bus, pool) = manager();

        let original = ScanResult {
            ip_address: "192.168.1.50".to_string(),
            mac_address: Some("A4:83:E7:11:22:33".to_string()),
            mdns_hostname: Some("macbook-pro".to_string()),
            dhcp_options: Some(vec![1, 3, 6]),
            ..Default::default()
        };
        manager.process_scan_result(&original).await.unwrap();

        // New MAC, new DHCP tuple, only the mDNS hostname still matches:
        // one strong signal, capped at 0.50 -> human verification.
        let ambiguous = ScanResult {
            ip_address: "192.168.1.51".to_string(),
            mac_address: Some("11:22:33:44:55:66".to_string()),
            mdns_hostname: Some("macbook-pro".to_string()),
            dhcp_options: Some(vec![1, 121, 33, 3]),
            ..Default::default()
        };
        manager.process_scan_result(&ambiguous).await.unwrap();

        let conn = pool.get().unwrap();
        let devices: i64 = conn
            .query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))
            .unwrap();
        assert_eq!(devices, 1);
        drop(conn);

        assert_eq!(events_of_type(&bus, "device.verification_needed").len(), 1);
        assert!(events_of_type(&bus, "device.updated").is_empty());
    }

    #[tokio::test]
    async fn test_enrich_ports_unknown_ip_is_noop() {
        let (manager, bus, pool) = manager();

        manager
            .enrich_device_ports(
                "10.0.0.99",
                &[PortScanResult {
                    port: 80,
                    service_name: Some("http".to_string()),
                    banner: None,
                }],
            )
            .await
            .unwrap();

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM device_open_ports", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert!(bus.replay(0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enrich_ports_publishes_update() {
        let (manager, bus, pool) = manager();
        manager
            .process_scan_result(&ScanResult::new("192.168.1.10", "A4:83:E7:00:00:01"))
            .await
            .unwrap();

        manager
            .enrich_device_ports(
                "192.168.1.10",
                &[
                    PortScanResult {
                        port: 22,
                        service_name: Some("ssh".to_string()),
                        banner: Some("SSH-2.0-OpenSSH_9.6".to_string()),
                    },
                    PortScanResult {
                        port: 8123,
                        service_name: None,
                        banner: None,
                    },
                ],
            )
            .await
            .unwrap();

        let conn = pool.get().unwrap();
        let ports: i64 = conn
            .query_row("SELECT COUNT(*) FROM device_open_ports", [], |row| row.get(0))
            .unwrap();
        assert_eq!(ports, 2);
        assert_eq!(events_of_type(&bus, "device.updated").len(), 1);
    }

    #[tokio::test]
    async fn test_enrich_discovery_never_overwrites_vendor() {
        let (manager, _bus, pool) = manager();
        manager
            .process_scan_result(&ScanResult::new("192.168.1.10", "A4:83:E7:00:00:01"))
            .await
            .unwrap();

        manager
            .enrich_device_discovery(
                "192.168.1.10",
                Some("living-room-tv"),
                Some("Friendly TV"),
                Some("SomeVendor"),
                Some("TV-1000"),
            )
            .await
            .unwrap();

        let conn = pool.get().unwrap();
        let (vendor, hostname, model): (String, String, String) = conn
            .query_row(
                "SELECT vendor, hostname, model_name FROM devices",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        // Vendor was already known (Apple), so UPnP must not replace it.
        assert_eq!(vendor, "Apple");
        // mDNS hostname wins over UPnP friendly name.
        assert_eq!(hostname, "living-room-tv");
        assert_eq!(model, "TV-1000");
    }

    #[tokio::test]
    async fn test_enrich_ha_matches_by_mac_case_insensitive() {
        let (manager, _bus, pool) = manager();
        manager
            .process_scan_result(&ScanResult::new("192.168.1.10", "A4:83:E7:00:00:01"))
            .await
            .unwrap();

        let ha_devices = vec![HaDevice {
            id: "ha1".to_string(),
            name: Some("Living Room Speaker".to_string()),
            manufacturer: Some("Sonos".to_string()),
            model: Some("One SL".to_string()),
            area_id: Some("living".to_string()),
            mac_addresses: vec!["a4:83:e7:00:00:01".to_string()],
        }];
        let ha_areas = vec![HaArea {
            id: "living".to_string(),
            name: "Living Room".to_string(),
        }];
        manager.enrich_device_ha(&ha_devices, &ha_areas).await.unwrap();

        let conn = pool.get().unwrap();
        let (hostname, model, area): (String, String, String) = conn
            .query_row(
                "SELECT hostname, model_name, area FROM devices",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(hostname, "Living Room Speaker");
        assert_eq!(model, "One SL");
        assert_eq!(area, "Living Room");
    }

    #[tokio::test]
    async fn test_restart_reload_restores_state() {
        let (manager, _bus, pool) = manager();
        let scan = ScanResult {
            ip_address: "192.168.1.60".to_string(),
            mac_address: Some("DC:A6:32:01:02:03".to_string()),
            mdns_hostname: Some("rpi-server.local".to_string()),
            open_ports: Some(vec![22, 8080]),
            ..Default::default()
        };
        manager.process_scan_result(&scan).await.unwrap();
        manager
            .enrich_device_ports(
                "192.168.1.60",
                &[
                    PortScanResult { port: 22, service_name: Some("ssh".into()), banner: None },
                    PortScanResult { port: 8080, service_name: None, banner: None },
                ],
            )
            .await
            .unwrap();

        // Simulate restart: a fresh manager over the same pool.
        let bus2 = Arc::new(EventBus::new(EventLog::new(pool.clone())));
        let classifier = DeviceClassifier::new(SignatureDb::bundled(), None);
        let reloaded = DeviceManager::new(pool.clone(), bus2, classifier);
        reloaded.load_known_devices().await.unwrap();

        let devices = reloaded.get_known_devices();
        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert_eq!(device.ip_address, "192.168.1.60");
        assert_eq!(device.mac_address.as_deref(), Some("DC:A6:32:01:02:03"));
        assert_eq!(device.fingerprint.mdns_hostname.as_deref(), Some("rpi-server"));
        assert!(device.open_ports.contains(&22));
        assert!(device.open_ports.contains(&8080));
    }
}
