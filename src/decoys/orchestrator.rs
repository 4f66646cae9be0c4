use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::db::queries::{credentials as db_credentials, decoys as db_decoys};
use crate::db::DbPool;
use crate::decoys::canary::CanaryManager;
use crate::decoys::credentials::{CredentialGenerator, CredentialType, GeneratedCredential};
use crate::decoys::types::{
    create_decoy, ConnectionCallback, Decoy, DecoyConnectionEvent, DecoyType,
};
use crate::error::{Result, SensorError};
use crate::events::{types, EventBus};
use crate::timefmt;

const DEV_PORTS: &[u16] = &[3000, 3001, 5173, 8000, 8080];
const HA_PORT: u16 = 8123;
const FILE_SHARE_PORTS: &[u16] = &[445, 548];
const HA_MDNS_SERVICE: &str = "_home-assistant._tcp";

const MAX_FAILURES_BEFORE_DEGRADED: u32 = 3;
const FAILURE_WINDOW_SECS: i64 = 5 * 60;
const DEGRADED_RETRY_INTERVAL_SECS: i64 = 30 * 60;

/// A service observed during Phase 2, used for decoy selection.
#[derive(Debug, Clone)]
pub struct DiscoveredService {
    pub ip: String,
    pub port: u16,
    pub protocol: String,
}

/// Health states for a managed decoy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoyHealth {
    Active,
    Restarting,
    Degraded,
    Stopped,
}

impl DecoyHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecoyHealth::Active => "active",
            DecoyHealth::Restarting => "restarting",
            DecoyHealth::Degraded => "degraded",
            DecoyHealth::Stopped => "stopped",
        }
    }
}

/// Internal tracking record for a deployed decoy.
struct DecoyRecord {
    decoy: Box<dyn Decoy>,
    health: DecoyHealth,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    failure_window_start: Option<DateTime<Utc>>,
}

impl DecoyRecord {
    fn new(decoy: Box<dyn Decoy>) -> Self {
        Self {
            decoy,
            health: DecoyHealth::Active,
            failure_count: 0,
            last_failure_at: None,
            failure_window_start: None,
        }
    }
}

/// Central manager for decoy lifecycle and health.
///
/// State machine per decoy:
/// active -> health check fails -> attempt restart -> active on success;
/// 3 restart failures within 5 minutes -> degraded; degraded decoys are
/// retried no more than every 30 minutes.
pub struct DecoyOrchestrator {
    bus: Arc<EventBus>,
    pool: DbPool,
    canary: Arc<CanaryManager>,
    canary_apex: String,
    max_decoys: usize,
    records: Mutex<HashMap<i64, DecoyRecord>>,
}

impl DecoyOrchestrator {
    pub fn new(
        bus: Arc<EventBus>,
        pool: DbPool,
        canary: Arc<CanaryManager>,
        canary_apex: &str,
        max_decoys: usize,
    ) -> Self {
        Self {
            bus,
            pool,
            canary,
            canary_apex: canary_apex.to_string(),
            max_decoys,
            records: Mutex::new(HashMap::new()),
        }
    }

    // -----------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------

    /// Pick decoy types appropriate for the observed network. Bounded by
    /// `max_decoys`; an empty network still gets a file share.
    pub fn select_decoys(
        &self,
        discovered_services: &[DiscoveredService],
        mdns_services: &HashSet<String>,
    ) -> Vec<DecoyType> {
        if self.max_decoys == 0 {
            return Vec::new();
        }

        let open_ports: HashSet<u16> = discovered_services.iter().map(|s| s.port).collect();
        let mut candidates = Vec::new();

        if DEV_PORTS.iter().any(|p| open_ports.contains(p)) {
            candidates.push(DecoyType::DevServer);
        }
        if mdns_services.contains(HA_MDNS_SERVICE) || open_ports.contains(&HA_PORT) {
            candidates.push(DecoyType::HomeAssistant);
        }
        if FILE_SHARE_PORTS.iter().any(|p| open_ports.contains(p)) {
            candidates.push(DecoyType::FileShare);
        }
        if candidates.is_empty() {
            candidates.push(DecoyType::FileShare);
        }

        candidates.truncate(self.max_decoys);
        candidates
    }

    // -----------------------------------------------------------------
    // Auto-deploy and resume
    // -----------------------------------------------------------------

    /// Deploy decoys from scan results if none exist yet. Called after
    /// Phase 2 of every scan cycle; a non-empty decoy table makes this a
    /// no-op. Returns the number of decoys deployed.
    pub async fn auto_deploy(&self, discovered_services: &[DiscoveredService]) -> Result<usize> {
        {
            let conn = self.pool.get()?;
            if db_decoys::count_decoys(&conn)? > 0 {
                return Ok(0);
            }
        }

        let candidates = self.select_decoys(discovered_services, &HashSet::new());
        let mut deployed = 0usize;

        for decoy_type in candidates {
            match self.create_and_deploy(decoy_type).await {
                Ok(()) => deployed += 1,
                Err(e) => {
                    log::error!("Failed to auto-deploy {} decoy: {e}", decoy_type.as_str());
                }
            }
        }

        if deployed > 0 {
            log::info!("Auto-deployed {deployed} decoys");
        }
        Ok(deployed)
    }

    async fn create_and_deploy(&self, decoy_type: DecoyType) -> Result<()> {
        let now = timefmt::now_iso();
        let credentials = self.generate_credentials(decoy_type)?;

        let config = match decoy_type {
            DecoyType::FileShare => json!({"password_filename": "passwords.txt"}),
            _ => json!({}),
        };

        let decoy_id = {
            let conn = self.pool.get()?;
            let decoy_id = db_decoys::insert_decoy(
                &conn,
                decoy_type.display_name(),
                decoy_type.as_str(),
                "0.0.0.0",
                0,
                &config.to_string(),
                &now,
            )?;
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
                if let Some(hostname) = &cred.canary_hostname {
                    self.canary.register_credential(hostname, cred_id);
                }
            }
            decoy_id
        };

        let decoy = create_decoy(
            decoy_type,
            decoy_id,
            decoy_type.display_name(),
            0,
            "0.0.0.0",
            credentials,
            &config,
        );
        self.deploy_decoy(decoy).await?;

        // Write back the OS-assigned port and announce the new decoy.
        let port = {
            let records = self.records.lock().await;
            records.get(&decoy_id).map(|r| r.decoy.port()).unwrap_or(0)
        };
        let row = {
            let conn = self.pool.get()?;
            db_decoys::update_port(&conn, decoy_id, port, &now)?;
            db_decoys::get_decoy(&conn, decoy_id)?
        };
        if let Some(row) = row {
            self.bus
                .publish(types::DECOY_STATUS_CHANGED, decoy_row_payload(&row), None)
                .await?;
        }
        Ok(())
    }

    fn generate_credentials(&self, decoy_type: DecoyType) -> Result<Vec<GeneratedCredential>> {
        let mut generator = CredentialGenerator::new(&self.canary_apex);
        match decoy_type {
            DecoyType::FileShare => {
                let mut creds = generator.generate_passwords_file()?;
                creds.push(generator.generate_ssh_key()?);
                creds.push(generator.generate_aws_key()?);
                Ok(creds)
            }
            DecoyType::DevServer => Ok(vec![generator.generate_env_file()?]),
            DecoyType::HomeAssistant => Ok(vec![generator.generate_ha_token()?]),
            DecoyType::Mimic => generator.generate_passwords_file(),
        }
    }

    /// Resume previously-active decoys from the database at startup.
    /// Mimics are handled by the mimic orchestrator, not here. A decoy
    /// that fails to start is marked stopped; the rest continue.
    pub async fn resume_active(&self) -> Result<usize> {
        let rows = {
            let conn = self.pool.get()?;
            db_decoys::list_active_by_type(&conn, db_decoys::ActiveFilter::NonMimic)?
        };
        if rows.is_empty() {
            return Ok(0);
        }

        let mut resumed = 0usize;
        for row in rows {
            let already_running = self.records.lock().await.contains_key(&row.id);
            if already_running {
                continue;
            }

            let outcome = self.resume_one(&row).await;
            match outcome {
                Ok(()) => resumed += 1,
                Err(e) => {
                    log::error!("Failed to resume decoy '{}' (id={}): {e}", row.name, row.id);
                    let conn = self.pool.get()?;
                    db_decoys::update_status(&conn, row.id, "stopped", &timefmt::now_iso())?;
                }
            }
        }

        log::info!("Resumed {resumed} active decoys from database");
        Ok(resumed)
    }

    async fn resume_one(&self, row: &db_decoys::DecoyRow) -> Result<()> {
        let decoy_type = DecoyType::from_str(&row.decoy_type)
            .ok_or_else(|| SensorError::Decoy(format!("unknown decoy type {}", row.decoy_type)))?;
        let (credentials, config) = {
            let conn = self.pool.get()?;
            let creds = load_generated_credentials(&conn, row.id)?;
            let config: serde_json::Value = row
                .config
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_else(|| json!({}));
            (creds, config)
        };

        let decoy = create_decoy(
            decoy_type,
            row.id,
            &row.name,
            row.port,
            &row.bind_address,
            credentials,
            &config,
        );
        self.deploy_decoy(decoy).await
    }

    // -----------------------------------------------------------------
    // Deployment
    // -----------------------------------------------------------------

    /// Start a decoy, wire its connection callback, and begin tracking it.
    pub async fn deploy_decoy(&self, mut decoy: Box<dyn Decoy>) -> Result<()> {
        let decoy_id = decoy.decoy_id();
        decoy.set_connection_callback(self.connection_callback(decoy_id));
        decoy.start().await?;

        let name = decoy.name().to_string();
        let decoy_type = decoy.decoy_type();
        let port = decoy.port();

        self.records
            .lock()
            .await
            .insert(decoy_id, DecoyRecord::new(decoy));

        self.bus
            .publish(
                types::DECOY_HEALTH_CHANGED,
                json!({
                    "decoy_id": decoy_id,
                    "name": name,
                    "decoy_type": decoy_type.as_str(),
                    "health": DecoyHealth::Active.as_str(),
                    "port": port,
                }),
                None,
            )
            .await?;

        log::info!("Deployed decoy '{name}' (id={decoy_id}) on port {port}");
        Ok(())
    }

    pub async fn active_count(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn decoy_health(&self, decoy_id: i64) -> Option<DecoyHealth> {
        self.records.lock().await.get(&decoy_id).map(|r| r.health)
    }

    /// Stop every tracked decoy (shutdown path).
    pub async fn stop_all(&self) {
        let mut records = self.records.lock().await;
        for record in records.values_mut() {
            record.decoy.stop().await;
            record.health = DecoyHealth::Stopped;
        }
    }

    // -----------------------------------------------------------------
    // Health monitoring
    // -----------------------------------------------------------------

    /// Run periodic health checks until shutdown. Unhealthy decoys are
    /// restarted; degraded decoys get a recovery attempt on a longer
    /// interval.
    pub async fn run_health_loop(&self, shutdown: CancellationToken, check_interval: Duration) {
        let mut degraded_tick = 0u32;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(check_interval) => {}
            }
            if let Err(e) = self.check_health().await {
                log::warn!("Decoy health check pass failed: {e}");
            }
            degraded_tick += 1;
            if degraded_tick >= 5 {
                degraded_tick = 0;
                if let Err(e) = self.check_degraded().await {
                    log::warn!("Degraded decoy recovery pass failed: {e}");
                }
            }
        }
        log::info!("Decoy health loop stopped");
    }

    /// One health-check pass over all active decoys.
    pub async fn check_health(&self) -> Result<()> {
        let now = Utc::now();
        let mut records = self.records.lock().await;

        for (decoy_id, record) in records.iter_mut() {
            if matches!(record.health, DecoyHealth::Degraded | DecoyHealth::Stopped) {
                continue;
            }
            if record.decoy.health_check().await {
                continue;
            }

            log::warn!(
                "Decoy '{}' (id={decoy_id}) health check failed, attempting restart",
                record.decoy.name()
            );
            record.health = DecoyHealth::Restarting;

            let window_expired = record
                .failure_window_start
                .map(|start| (now - start).num_seconds() > FAILURE_WINDOW_SECS)
                .unwrap_or(true);
            if window_expired {
                record.failure_count = 0;
                record.failure_window_start = Some(now);
            }

            match record.decoy.start().await {
                Ok(()) => {
                    record.health = DecoyHealth::Active;
                    record.failure_count = 0;
                    log::info!(
                        "Decoy '{}' (id={decoy_id}) restarted successfully",
                        record.decoy.name()
                    );
                }
                Err(e) => {
                    record.failure_count += 1;
                    record.last_failure_at = Some(now);
                    {
                        let conn = self.pool.get()?;
                        db_decoys::record_failure(&conn, *decoy_id, &timefmt::format_iso(now))?;
                    }
                    log::error!(
                        "Decoy '{}' (id={decoy_id}) restart failed ({}/{}): {e}",
                        record.decoy.name(),
                        record.failure_count,
                        MAX_FAILURES_BEFORE_DEGRADED
                    );

                    if record.failure_count >= MAX_FAILURES_BEFORE_DEGRADED {
                        record.health = DecoyHealth::Degraded;
                        self.bus
                            .publish(
                                types::DECOY_HEALTH_CHANGED,
                                json!({
                                    "decoy_id": decoy_id,
                                    "name": record.decoy.name(),
                                    "health": DecoyHealth::Degraded.as_str(),
                                    "failure_count": record.failure_count,
                                }),
                                None,
                            )
                            .await?;
                    } else {
                        // Retried on the next pass.
                        record.health = DecoyHealth::Active;
                    }
                }
            }
        }
        Ok(())
    }

    /// Attempt recovery of degraded decoys past the retry interval.
    pub async fn check_degraded(&self) -> Result<()> {
        let now = Utc::now();
        let mut records = self.records.lock().await;

        for (decoy_id, record) in records.iter_mut() {
            if record.health != DecoyHealth::Degraded {
                continue;
            }
            let too_soon = record
                .last_failure_at
                .map(|at| (now - at).num_seconds() < DEGRADED_RETRY_INTERVAL_SECS)
                .unwrap_or(false);
            if too_soon {
                continue;
            }

            log::info!(
                "Attempting recovery of degraded decoy '{}' (id={decoy_id})",
                record.decoy.name()
            );
            match record.decoy.start().await {
                Ok(()) => {
                    record.health = DecoyHealth::Active;
                    record.failure_count = 0;
                    record.failure_window_start = None;
                    self.bus
                        .publish(
                            types::DECOY_HEALTH_CHANGED,
                            json!({
                                "decoy_id": decoy_id,
                                "name": record.decoy.name(),
                                "health": DecoyHealth::Active.as_str(),
                            }),
                            None,
                        )
                        .await?;
                    log::info!("Degraded decoy '{}' (id={decoy_id}) recovered", record.decoy.name());
                }
                Err(e) => {
                    record.last_failure_at = Some(now);
                    log::error!(
                        "Recovery of degraded decoy '{}' (id={decoy_id}) failed: {e}",
                        record.decoy.name()
                    );
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Manual restart
    // -----------------------------------------------------------------

    /// Restart a decoy, rebuilding it from its persisted row so config
    /// edits take effect. Resets failure counters.
    pub async fn restart_decoy(&self, decoy_id: i64) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&decoy_id)
            .ok_or(SensorError::DecoyNotFound(decoy_id))?;

        record.decoy.stop().await;

        let row = {
            let conn = self.pool.get()?;
            db_decoys::get_decoy(&conn, decoy_id)?
        };

        if let Some(row) = row {
            let (credentials, config) = {
                let conn = self.pool.get()?;
                let creds = load_generated_credentials(&conn, decoy_id)?;
                let config: serde_json::Value = row
                    .config
                    .as_deref()
                    .and_then(|raw| serde_json::from_str(raw).ok())
                    .unwrap_or_else(|| json!({}));
                (creds, config)
            };
            let decoy_type = DecoyType::from_str(&row.decoy_type)
                .ok_or_else(|| SensorError::Decoy(format!("unknown decoy type {}", row.decoy_type)))?;
            let mut fresh = create_decoy(
                decoy_type,
                decoy_id,
                &row.name,
                record.decoy.port(),
                record.decoy.bind_address(),
                credentials,
                &config,
            );
            fresh.set_connection_callback(self.connection_callback(decoy_id));
            fresh.start().await?;
            record.decoy = fresh;
        } else {
            record.decoy.start().await?;
        }

        record.health = DecoyHealth::Active;
        record.failure_count = 0;
        record.failure_window_start = None;
        let name = record.decoy.name().to_string();
        drop(records);

        self.bus
            .publish(
                types::DECOY_HEALTH_CHANGED,
                json!({
                    "decoy_id": decoy_id,
                    "name": name,
                    "health": DecoyHealth::Active.as_str(),
                }),
                None,
            )
            .await?;

        log::info!("Decoy '{name}' (id={decoy_id}) manually restarted");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Connection handling
    // -----------------------------------------------------------------

    /// Per-decoy connection callback. The decoy handler is synchronous,
    /// so publishing runs fire-and-forget on the shared runtime.
    fn connection_callback(&self, decoy_id: i64) -> ConnectionCallback {
        let bus = self.bus.clone();
        Arc::new(move |event: DecoyConnectionEvent| {
            let bus = bus.clone();
            tokio::spawn(async move {
                if let Err(e) = publish_connection_events(&bus, decoy_id, event).await {
                    log::warn!("Failed to publish decoy connection events: {e}");
                }
            });
        })
    }
}

async fn publish_connection_events(
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
                "detection_method": "decoy_http",
            }),
            None,
        )
        .await?;
    }
    Ok(())
}

/// Rebuild GeneratedCredential values from their persisted rows.
pub(crate) fn load_generated_credentials(
    conn: &rusqlite::Connection,
    decoy_id: i64,
) -> Result<Vec<GeneratedCredential>> {
    let rows = db_credentials::list_for_decoy(conn, decoy_id)?;
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let credential_type = CredentialType::from_str(&row.credential_type)?;
            Some(GeneratedCredential {
                credential_type,
                credential_value: row.credential_value,
                planted_location: row.planted_location,
                canary_hostname: row.canary_hostname,
            })
        })
        .collect())
}

fn decoy_row_payload(row: &db_decoys::DecoyRow) -> serde_json::Value {
    json!({
        "id": row.id,
        "name": row.name,
        "decoy_type": row.decoy_type,
        "bind_address": row.bind_address,
        "port": row.port,
        "status": row.status,
        "connection_count": row.connection_count,
        "credential_trip_count": row.credential_trip_count,
        "created_at": row.created_at,
        "updated_at": row.updated_at,
    })
}
