use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;

use crate::db::queries::{
    credentials as db_credentials, decoys as db_decoys, devices as db_devices,
    profiles as db_profiles, virtual_ips as db_vips,
};
use crate::db::DbPool;
use crate::decoys::canary::CanaryManager;
use crate::decoys::credentials::{CredentialGenerator, GeneratedCredential};
use crate::decoys::orchestrator::load_generated_credentials;
use crate::decoys::types::mimic::{MimicDecoy, MimicPortConfig, RouteConfig};
use crate::decoys::types::{ConnectionCallback, Decoy, DecoyConnectionEvent};
use crate::error::Result;
use crate::events::{types, EventBus};
use crate::network::port_forward::{needs_remap, remap_port, PortForwardManager};
use crate::network::virtual_ip::VirtualIpManager;
use crate::scouts::engine::ScoutEngine;
use crate::scouts::mdns::{generate_mimic_hostname, MimicMdnsAdvertiser};
use crate::scouts::templates::MimicTemplateGenerator;
use crate::timefmt;

/// Manages the full mimic lifecycle: scouted profiles become templates,
/// templates get a virtual IP and planted credentials, and a MimicDecoy
/// serves the clone.
pub struct MimicOrchestrator {
    engine: Arc<ScoutEngine>,
    template_generator: MimicTemplateGenerator,
    ip_manager: Arc<VirtualIpManager>,
    bus: Arc<EventBus>,
    pool: DbPool,
    canary: Arc<CanaryManager>,
    max_mimics: usize,
    mdns: Option<Arc<MimicMdnsAdvertiser>>,
    port_forwards: Option<Arc<PortForwardManager>>,
    credential_generator: std::sync::Mutex<CredentialGenerator>,
    active: Mutex<HashMap<i64, MimicDecoy>>,
}

impl MimicOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<ScoutEngine>,
        ip_manager: Arc<VirtualIpManager>,
        bus: Arc<EventBus>,
        pool: DbPool,
        canary: Arc<CanaryManager>,
        canary_apex: &str,
        max_mimics: usize,
        mdns: Option<Arc<MimicMdnsAdvertiser>>,
        port_forwards: Option<Arc<PortForwardManager>>,
    ) -> Self {
        Self {
            engine,
            template_generator: MimicTemplateGenerator::new(),
            ip_manager,
            bus,
            pool,
            canary,
            max_mimics,
            mdns,
            port_forwards,
            credential_generator: std::sync::Mutex::new(CredentialGenerator::new(canary_apex)),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// After a scout cycle: pick the best unmimicked candidates and deploy
    /// clones, up to `max_mimics`. Returns the number deployed.
    pub async fn evaluate_and_deploy(&self) -> Result<usize> {
        if self.max_mimics == 0 {
            return Ok(0);
        }
        let slots = self.max_mimics.saturating_sub(self.active.lock().await.len());
        if slots == 0 {
            log::debug!("Max mimics reached ({}), skipping deploy", self.max_mimics);
            return Ok(0);
        }

        let candidates = {
            let conn = self.pool.get()?;
            db_profiles::get_mimic_candidates(&conn, slots * 4)?
        };
        if candidates.is_empty() {
            log::debug!("No mimic candidates available");
            return Ok(0);
        }

        // Group candidate profiles by device, skipping devices already
        // mimicked.
        let mimicked = self.mimicked_device_ids().await?;
        let mut by_device: HashMap<i64, Vec<db_profiles::ServiceProfile>> = HashMap::new();
        for profile in candidates {
            if !mimicked.contains(&profile.device_id) {
                by_device.entry(profile.device_id).or_default().push(profile);
            }
        }
        if by_device.is_empty() {
            log::debug!("All candidate devices already mimicked");
            return Ok(0);
        }

        let mut deployed = 0usize;
        for (device_id, profiles) in by_device {
            if deployed >= slots {
                break;
            }
            match self.deploy_for_device(device_id, &profiles).await {
                Ok(true) => deployed += 1,
                Ok(false) => {}
                Err(e) => log::error!("Failed to deploy mimic for device {device_id}: {e}"),
            }
        }

        if deployed > 0 {
            log::info!("Deployed {deployed} new mimic decoys");
        }
        Ok(deployed)
    }

    async fn deploy_for_device(
        &self,
        device_id: i64,
        profiles: &[db_profiles::ServiceProfile],
    ) -> Result<bool> {
        let (device_type, hostname) = {
            let conn = self.pool.get()?;
            match db_devices::get_device_type_and_hostname(&conn, device_id)? {
                Some(info) => info,
                None => return Ok(false),
            }
        };

        // The candidate list only covers HTTP-rich ports; a full clone
        // also replays the device's banner ports.
        let all_profiles = self.engine.profiles_for_device(device_id)?;
        let profiles = if all_profiles.is_empty() { profiles.to_vec() } else { all_profiles };

        let template =
            self.template_generator
                .generate(&profiles, &device_type, hostname.as_deref());
        let has_banner = profiles.iter().any(|p| p.protocol_version.is_some());
        if template.routes.is_empty() && !has_banner {
            log::debug!("No HTTP routes or banners for device {device_id}, skipping");
            return Ok(false);
        }

        // Allocate and alias a virtual IP. Failure here rolls the
        // reservation back inside the manager and aborts the deploy.
        let virtual_ip = self.ip_manager.acquire().await?.to_string();

        let credentials = self.generate_credentials(&template.credential_types)?;
        let port_configs = build_port_configs(&profiles, &template.routes);
        let port_remaps = compute_port_remaps(&port_configs);
        let primary_port = port_configs.first().map(|c| c.port).unwrap_or(0);
        let mdns_hostname = generate_mimic_hostname(
            template.mdns_name.as_deref(),
            &template.device_category,
            &virtual_ip,
        );

        let now = timefmt::now_iso();
        let mimic_name = format!(
            "Mimic: {}",
            hostname.clone().unwrap_or_else(|| template.source_ip.clone())
        );

        let (decoy_id, template_id) = {
            let conn = self.pool.get()?;
            let template_id = db_profiles::insert_template(
                &conn,
                device_id,
                &template.source_ip,
                &template.device_category,
                &serde_json::to_string(&template.routes)?,
                template.server_header.as_deref(),
                &serde_json::to_string(&template.credential_types)?,
                template.mdns_service_type.as_deref(),
                template.mdns_name.as_deref(),
                &now,
            )?;

            let config = json!({
                "template_id": template_id,
                "mdns_hostname": mdns_hostname,
            });
            let decoy_id = db_decoys::insert_decoy(
                &conn,
                &mimic_name,
                "mimic",
                &virtual_ip,
                primary_port,
                &config.to_string(),
                &now,
            )?;
            db_vips::link_decoy(&conn, &virtual_ip, Some(decoy_id))?;

            for cred in &credentials {
                let cred_id = db_credentials::insert_credential(
                    &conn,
                    cred.credential_type.as_str(),
                    &cred.credential_value,
                    &cred.planted_location,
                    cred.canary_hostname.as_deref(),
                    Some(decoy_id),
                    &now,
                )?;
                if let Some(canary_hostname) = &cred.canary_hostname {
                    self.canary.register_credential(canary_hostname, cred_id);
                }
            }
            (decoy_id, template_id)
        };

        let mut mimic = MimicDecoy::new(
            decoy_id,
            &mimic_name,
            &virtual_ip,
            port_configs.clone(),
            template.server_header.clone(),
            credentials,
            port_remaps.clone(),
        );
        mimic.set_connection_callback(self.connection_callback(decoy_id));

        if let Err(e) = mimic.start().await {
            log::error!("Failed to start mimic decoy {decoy_id}: {e}");
            self.ip_manager.release(&virtual_ip).await?;
            let conn = self.pool.get()?;
            db_decoys::delete_decoy(&conn, decoy_id)?;
            return Ok(false);
        }

        if !port_remaps.is_empty() {
            if let Some(port_forwards) = &self.port_forwards {
                let ok = port_forwards
                    .add_forwards(decoy_id, &virtual_ip, &port_remaps)
                    .await?;
                if !ok {
                    log::warn!(
                        "Port forwarding setup failed for mimic {decoy_id}; privileged ports may be unreachable"
                    );
                }
            }
        }

        if let Some(mdns) = &self.mdns {
            if let Err(e) = mdns.register(
                decoy_id,
                &virtual_ip,
                primary_port.max(80),
                template
                    .mdns_service_type
                    .as_deref()
                    .unwrap_or("_http._tcp.local."),
                &mdns_hostname,
            ) {
                log::warn!("mDNS registration failed for mimic {decoy_id}: {e}");
            }
        }

        self.active.lock().await.insert(decoy_id, mimic);

        self.bus
            .publish(
                types::DECOY_STATUS_CHANGED,
                json!({
                    "id": decoy_id,
                    "name": mimic_name,
                    "decoy_type": "mimic",
                    "bind_address": virtual_ip,
                    "port": primary_port,
                    "status": "active",
                    "connection_count": 0,
                    "credential_trip_count": 0,
                    "created_at": now,
                    "updated_at": now,
                }),
                None,
            )
            .await?;

        log::info!(
            "Deployed mimic '{mimic_name}' on {virtual_ip} as '{mdns_hostname}' \
             (device {device_id}, template {template_id}, {} ports)",
            port_configs.len()
        );
        Ok(true)
    }

    fn generate_credentials(&self, credential_types: &[String]) -> Result<Vec<GeneratedCredential>> {
        let mut generator = self.credential_generator.lock().unwrap();
        let mut creds = Vec::new();
        for credential_type in credential_types {
            match credential_type.as_str() {
                "ha_token" => creds.push(generator.generate_ha_token()?),
                "ssh_key" => creds.push(generator.generate_ssh_key()?),
                "env_file" => creds.push(generator.generate_env_file()?),
                "password" => creds.extend(generator.generate_passwords_file()?),
                other => log::debug!("Unknown credential strategy entry '{other}', skipping"),
            }
        }
        Ok(creds)
    }

    async fn mimicked_device_ids(&self) -> Result<HashSet<i64>> {
        let conn = self.pool.get()?;
        let rows = db_decoys::list_active_by_type(&conn, db_decoys::ActiveFilter::Mimic)?;
        let mut ids = HashSet::new();
        for row in rows {
            if let Some(template_id) = parse_template_id(row.config.as_deref()) {
                if let Some(source) = db_profiles::get_template_source(&conn, template_id)? {
                    ids.insert(source);
                }
            }
        }
        Ok(ids)
    }

    /// Stop and remove a mimic: tear down forwards and mDNS, release the
    /// virtual IP, delete its rows. Returns false if nothing was found.
    pub async fn remove_mimic(&self, decoy_id: i64) -> Result<bool> {
        if let Some(port_forwards) = &self.port_forwards {
            port_forwards.remove_forwards(decoy_id).await?;
        }
        if let Some(mdns) = &self.mdns {
            mdns.unregister(decoy_id);
        }

        let mimic = self.active.lock().await.remove(&decoy_id);
        let mut bind_address = None;
        if let Some(mut mimic) = mimic {
            bind_address = Some(mimic.bind_address().to_string());
            mimic.stop().await;
        }

        let row = {
            let conn = self.pool.get()?;
            db_decoys::get_decoy(&conn, decoy_id)?
        };
        let Some(row) = row else {
            return Ok(bind_address.is_some());
        };
        if row.decoy_type != "mimic" {
            return Ok(false);
        }

        let ip = bind_address.unwrap_or_else(|| row.bind_address.clone());
        self.ip_manager.release(&ip).await?;

        {
            let conn = self.pool.get()?;
            db_vips::delete_for_decoy(&conn, decoy_id)?;
            db_decoys::delete_decoy(&conn, decoy_id)?;
        }

        self.bus
            .publish(
                types::DECOY_STATUS_CHANGED,
                json!({
                    "id": decoy_id,
                    "name": row.name,
                    "decoy_type": "mimic",
                    "bind_address": ip,
                    "port": row.port,
                    "status": "removed",
                }),
                None,
            )
            .await?;

        log::info!("Removed mimic decoy '{}' (id={decoy_id})", row.name);
        Ok(true)
    }

    /// A real device appeared at one of our virtual IPs: evacuate the
    /// mimic occupying it. No redeploy on the same IP.
    pub async fn handle_ip_conflict(&self, ip: &str) -> Result<()> {
        let conflicting = {
            let active = self.active.lock().await;
            active
                .iter()
                .find(|(_, mimic)| mimic.bind_address() == ip)
                .map(|(id, mimic)| (*id, mimic.name().to_string()))
        };
        if let Some((decoy_id, name)) = conflicting {
            log::warn!("IP conflict: real device at {ip}, evacuating mimic '{name}'");
            self.remove_mimic(decoy_id).await?;
        }
        Ok(())
    }

    /// Restart a stopped mimic from its persisted template, credentials,
    /// and scout profiles.
    pub async fn restart_mimic(&self, decoy_id: i64) -> Result<bool> {
        if self.active.lock().await.contains_key(&decoy_id) {
            return Ok(true);
        }

        let row = {
            let conn = self.pool.get()?;
            db_decoys::get_decoy(&conn, decoy_id)?
        };
        let Some(row) = row else {
            return Ok(false);
        };
        if row.decoy_type != "mimic" {
            return Ok(false);
        }

        let ok = self
            .ops_add_alias(&row.bind_address)
            .await
            .unwrap_or(false);
        if !ok {
            log::warn!(
                "Failed to re-add IP alias {} for mimic {decoy_id}",
                row.bind_address
            );
            return Ok(false);
        }

        match self.rebuild_and_start(&row).await {
            Ok(true) => {
                let now = timefmt::now_iso();
                let conn = self.pool.get()?;
                db_decoys::update_status(&conn, decoy_id, "active", &now)?;
                drop(conn);
                self.bus
                    .publish(
                        types::DECOY_STATUS_CHANGED,
                        json!({
                            "id": decoy_id,
                            "name": row.name,
                            "decoy_type": "mimic",
                            "bind_address": row.bind_address,
                            "port": row.port,
                            "status": "active",
                            "connection_count": row.connection_count,
                            "credential_trip_count": row.credential_trip_count,
                            "created_at": row.created_at,
                            "updated_at": now,
                        }),
                        None,
                    )
                    .await?;
                log::info!("Restarted mimic decoy '{}' (id={decoy_id})", row.name);
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                log::error!("Failed to restart mimic decoy {decoy_id}: {e}");
                Ok(false)
            }
        }
    }

    async fn ops_add_alias(&self, ip: &str) -> Result<bool> {
        // Re-adding goes through the IP manager so pool state stays
        // consistent with what the OS has installed.
        if let Ok(parsed) = ip.parse::<std::net::Ipv4Addr>() {
            self.ip_manager.restore_single(parsed).await
        } else {
            Ok(false)
        }
    }

    /// Resume active mimics from the database at startup. mDNS hostnames
    /// are backfilled into config for mimics deployed before mDNS support.
    pub async fn resume_active(&self) -> Result<usize> {
        let rows = {
            let conn = self.pool.get()?;
            db_decoys::list_active_by_type(&conn, db_decoys::ActiveFilter::Mimic)?
        };
        if rows.is_empty() {
            return Ok(0);
        }

        let mut resumed = 0usize;
        for row in rows {
            if self.active.lock().await.contains_key(&row.id) {
                continue;
            }
            match self.rebuild_and_start(&row).await {
                Ok(true) => resumed += 1,
                Ok(false) => {}
                Err(e) => {
                    log::error!("Failed to resume mimic decoy {}: {e}", row.id);
                    let conn = self.pool.get()?;
                    db_decoys::update_status(&conn, row.id, "stopped", &timefmt::now_iso())?;
                }
            }
        }

        if resumed > 0 {
            log::info!("Resumed {resumed} mimic decoys");
        }
        Ok(resumed)
    }

    /// Rebuild a mimic from persisted state and start it. Shared by
    /// restart and resume.
    async fn rebuild_and_start(&self, row: &db_decoys::DecoyRow) -> Result<bool> {
        let decoy_id = row.id;
        let mut config: serde_json::Value = row
            .config
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_else(|| json!({}));
        let Some(template_id) = config["template_id"].as_i64() else {
            return Ok(false);
        };

        let (template_row, credentials) = {
            let conn = self.pool.get()?;
            let Some(template_row) = db_profiles::get_template(&conn, template_id)? else {
                return Ok(false);
            };
            let credentials = load_generated_credentials(&conn, decoy_id)?;
            (template_row, credentials)
        };
        let profiles = self.engine.profiles_for_device(template_row.source_device_id)?;

        let routes: Vec<RouteConfig> =
            serde_json::from_str(&template_row.routes_json).unwrap_or_default();
        let port_configs = build_port_configs(&profiles, &routes);
        if port_configs.is_empty() {
            return Ok(false);
        }
        let port_remaps = compute_port_remaps(&port_configs);

        let mut mimic = MimicDecoy::new(
            decoy_id,
            &row.name,
            &row.bind_address,
            port_configs.clone(),
            template_row.server_header.clone(),
            credentials,
            port_remaps.clone(),
        );
        mimic.set_connection_callback(self.connection_callback(decoy_id));
        mimic.start().await?;

        if !port_remaps.is_empty() {
            if let Some(port_forwards) = &self.port_forwards {
                port_forwards
                    .add_forwards(decoy_id, &row.bind_address, &port_remaps)
                    .await?;
            }
        }

        if let Some(mdns) = &self.mdns {
            let mdns_hostname = match config["mdns_hostname"].as_str() {
                Some(hostname) => hostname.to_string(),
                None => {
                    // Backfill for mimics deployed before mDNS support.
                    let hostname = generate_mimic_hostname(
                        template_row.mdns_name.as_deref(),
                        &template_row.device_category,
                        &row.bind_address,
                    );
                    config["mdns_hostname"] = json!(hostname);
                    let conn = self.pool.get()?;
                    db_decoys::update_config(&conn, decoy_id, &config.to_string())?;
                    hostname
                }
            };
            let primary_port = port_configs.first().map(|c| c.port).unwrap_or(80);
            if let Err(e) = mdns.register(
                decoy_id,
                &row.bind_address,
                primary_port.max(80),
                template_row
                    .mdns_service_type
                    .as_deref()
                    .unwrap_or("_http._tcp.local."),
                &mdns_hostname,
            ) {
                log::warn!("mDNS registration failed for mimic {decoy_id}: {e}");
            }
        }

        self.active.lock().await.insert(decoy_id, mimic);
        Ok(true)
    }

    /// Stop all mimics, release their IPs, clear port-forward rules.
    pub async fn stop_all(&self) -> Result<()> {
        let ids: Vec<i64> = self.active.lock().await.keys().copied().collect();
        for decoy_id in ids {
            let mimic = self.active.lock().await.remove(&decoy_id);
            if let Some(mut mimic) = mimic {
                let ip = mimic.bind_address().to_string();
                mimic.stop().await;
                if let Err(e) = self.ip_manager.release(&ip).await {
                    log::warn!("Failed to release virtual IP {ip}: {e}");
                }
            }
            if let Some(mdns) = &self.mdns {
                mdns.unregister(decoy_id);
            }
        }
        if let Some(port_forwards) = &self.port_forwards {
            port_forwards.clear_all().await?;
        }
        Ok(())
    }

    fn connection_callback(&self, decoy_id: i64) -> ConnectionCallback {
        let bus = self.bus.clone();
        Arc::new(move |event: DecoyConnectionEvent| {
            let bus = bus.clone();
            tokio::spawn(async move {
                if let Err(e) = publish_mimic_trip(&bus, decoy_id, event).await {
                    log::warn!("Failed to publish mimic trip events: {e}");
                }
            });
        })
    }
}

async fn publish_mimic_trip(
    bus: &EventBus,
    decoy_id: i64,
    event: DecoyConnectionEvent,
) -> Result<()> {
    let timestamp = timefmt::format_iso(event.timestamp);
    bus.publish(
        types::DECOY_TRIP,
        json!({
            "decoy_id": decoy_id,
            "source_ip": event.source_ip,
            "source_port": event.source_port,
            "dest_port": event.dest_port,
            "protocol": event.protocol,
            "request_path": event.request_path,
            "timestamp": timestamp,
        }),
        None,
    )
    .await?;

    if let Some(credential) = &event.credential_used {
        bus.publish(
            types::DECOY_CREDENTIAL_TRIP,
            json!({
                "decoy_id": decoy_id,
                "source_ip": event.source_ip,
                "source_port": event.source_port,
                "dest_port": event.dest_port,
                "credential_used": credential,
                "request_path": event.request_path,
                "timestamp": timestamp,
                "detection_method": "mimic_decoy",
            }),
            None,
        )
        .await?;
    }
    Ok(())
}

/// Build per-port serving configs from profiles plus template routes.
fn build_port_configs(
    profiles: &[db_profiles::ServiceProfile],
    routes: &[RouteConfig],
) -> Vec<MimicPortConfig> {
    let route_by_port: HashMap<u16, &RouteConfig> = routes
        .iter()
        .filter_map(|route| route.port.map(|port| (port, route)))
        .collect();

    profiles
        .iter()
        .map(|profile| {
            if let Some(route) = route_by_port.get(&profile.port) {
                MimicPortConfig {
                    port: profile.port,
                    routes: vec![(*route).clone()],
                    protocol_banner: None,
                }
            } else if let Some(status) = profile.http_status {
                MimicPortConfig {
                    port: profile.port,
                    routes: vec![RouteConfig {
                        path: "/".to_string(),
                        method: "GET".to_string(),
                        status,
                        headers: profile.http_headers.clone().unwrap_or_default(),
                        body: profile.http_body_snippet.clone().unwrap_or_default(),
                        port: Some(profile.port),
                    }],
                    protocol_banner: None,
                }
            } else {
                MimicPortConfig {
                    port: profile.port,
                    routes: Vec::new(),
                    protocol_banner: Some(profile.protocol_version.clone().unwrap_or_default()),
                }
            }
        })
        .collect()
}

/// `{advertised_port: high_port}` for every privileged port.
fn compute_port_remaps(port_configs: &[MimicPortConfig]) -> HashMap<u16, u16> {
    port_configs
        .iter()
        .filter(|config| needs_remap(config.port))
        .map(|config| (config.port, remap_port(config.port)))
        .collect()
}

fn parse_template_id(config: Option<&str>) -> Option<i64> {
    let value: serde_json::Value = serde_json::from_str(config?).ok()?;
    value["template_id"].as_i64()
}
