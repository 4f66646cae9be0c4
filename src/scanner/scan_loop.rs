use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::alerts::insights::{DeviceExposure, SecurityInsightAnalyzer};
use crate::config::Config;
use crate::db::queries::virtual_ips as db_vips;
use crate::db::DbPool;
use crate::decoys::orchestrator::{DecoyOrchestrator, DiscoveredService};
use crate::devices::manager::{DeviceManager, ScanResult};
use crate::error::Result;
use crate::events::{types, EventBus};
use crate::integrations::home_assistant::HomeAssistantClient;
use crate::network::interface::{detect_local_ip, resolve_subnet};
use crate::privileged::PrivilegedOps;
use crate::scanner::mdns::MdnsBrowser;
use crate::scanner::port::PortScanner;
use crate::scanner::ssdp::SsdpScanner;
use crate::scanner::DEFAULT_SCAN_PORTS;
use crate::scouts::mimic_orchestrator::MimicOrchestrator;

/// Periodic three-phase network scan loop.
///
/// Phase 1: ARP discovery; devices are durable after this phase.
/// Phase 2: async TCP port scan + decoy auto-deploy + security analysis.
/// Phase 3: Home Assistant enrichment when configured, otherwise
///          mDNS/SSDP discovery.
///
/// Phase 2/3 failures never block device creation from Phase 1, and one
/// cycle failing never stops the loop.
pub struct ScanLoop {
    manager: Arc<DeviceManager>,
    bus: Arc<EventBus>,
    ops: Arc<dyn PrivilegedOps>,
    pool: DbPool,
    subnet: String,
    scan_interval: Duration,
    scan_ports: Vec<u16>,
    port_scanner: PortScanner,
    mdns: MdnsBrowser,
    ssdp: SsdpScanner,
    live_config: Arc<RwLock<Config>>,
    ha_state: Mutex<HaState>,
    orchestrator: Mutex<Option<Arc<DecoyOrchestrator>>>,
    mimic_orchestrator: Mutex<Option<Arc<MimicOrchestrator>>>,
    security_analyzer: Option<SecurityInsightAnalyzer>,
}

#[derive(Default)]
struct HaState {
    client: Option<Arc<HomeAssistantClient>>,
    url: String,
    token: String,
}

impl ScanLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manager: Arc<DeviceManager>,
        bus: Arc<EventBus>,
        ops: Arc<dyn PrivilegedOps>,
        pool: DbPool,
        live_config: Arc<RwLock<Config>>,
        port_scanner: PortScanner,
        mdns: MdnsBrowser,
        ssdp: SsdpScanner,
        security_analyzer: Option<SecurityInsightAnalyzer>,
    ) -> Self {
        let (subnet, scan_interval, scan_ports) = {
            let config = live_config.read().unwrap();
            (
                resolve_subnet(&config.network.subnet),
                Duration::from_secs(config.network.scan_interval),
                if config.network.scan_ports.is_empty() {
                    DEFAULT_SCAN_PORTS.to_vec()
                } else {
                    config.network.scan_ports.clone()
                },
            )
        };

        Self {
            manager,
            bus,
            ops,
            pool,
            subnet,
            scan_interval,
            scan_ports,
            port_scanner,
            mdns,
            ssdp,
            live_config,
            ha_state: Mutex::new(HaState::default()),
            orchestrator: Mutex::new(None),
            mimic_orchestrator: Mutex::new(None),
            security_analyzer,
        }
    }

    /// One-way injection: the orchestrator never learns about the loop.
    pub fn set_orchestrator(&self, orchestrator: Arc<DecoyOrchestrator>) {
        *self.orchestrator.lock().unwrap() = Some(orchestrator);
    }

    pub fn set_mimic_orchestrator(&self, orchestrator: Arc<MimicOrchestrator>) {
        *self.mimic_orchestrator.lock().unwrap() = Some(orchestrator);
    }

    pub fn scan_interval(&self) -> Duration {
        self.scan_interval
    }

    pub fn subnet(&self) -> &str {
        &self.subnet
    }

    /// Run until shutdown. Loads known devices once, then cycles.
    pub async fn run(&self, shutdown: CancellationToken) {
        if let Err(e) = self.manager.load_known_devices().await {
            log::error!("Failed to load known devices: {e}");
        }

        log::info!(
            "Scan loop started: subnet={}, interval={}s, known_devices={}",
            self.subnet,
            self.scan_interval.as_secs(),
            self.manager.get_known_devices().len()
        );

        loop {
            if let Err(e) = self.run_single_scan().await {
                log::error!("Scan cycle failed: {e}");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.scan_interval) => {}
            }
        }
        log::info!("Scan loop stopped");
    }

    /// Run one full three-phase cycle.
    pub async fn run_single_scan(&self) -> Result<()> {
        let scan_id = Uuid::new_v4();
        let started = Instant::now();
        log::info!("Starting scan cycle {scan_id}");

        // ---- Phase 1: ARP discovery + device creation ----
        let arp_results = match self.ops.arp_scan(&self.subnet).await {
            Ok(results) => {
                log::info!("ARP scan found {} hosts", results.len());
                results
            }
            Err(e) => {
                log::error!("ARP scan failed: {e}");
                Vec::new()
            }
        };

        if arp_results.is_empty() {
            self.bus
                .publish(
                    types::SYSTEM_SCAN_COMPLETE,
                    json!({
                        "scan_id": scan_id.to_string(),
                        "device_count": 0,
                        "scan_duration_ms": started.elapsed().as_millis() as u64,
                    }),
                    None,
                )
                .await?;
            return Ok(());
        }

        let own_aliases = self.handle_virtual_ip_hits(&arp_results).await;

        let mut target_ips = Vec::new();
        for (ip, mac) in &arp_results {
            if own_aliases.contains(ip) {
                continue;
            }
            target_ips.push(ip.clone());
            let scan = ScanResult::new(ip, mac);
            if let Err(e) = self.manager.process_scan_result(&scan).await {
                log::error!("Failed to process ARP result for {ip}: {e}");
            }
        }
        log::info!(
            "Phase 1 complete: {} devices tracked in {}ms",
            self.manager.get_known_devices().len(),
            started.elapsed().as_millis()
        );

        // ---- Phase 2: port scan + enrichment ----
        let port_results = self
            .port_scanner
            .scan_with_banners(&target_ips, &self.scan_ports)
            .await;
        let mut enriched = 0usize;
        for (ip, results) in &port_results {
            if results.is_empty() {
                continue;
            }
            match self.manager.enrich_device_ports(ip, results).await {
                Ok(()) => enriched += 1,
                Err(e) => log::error!("Port enrichment failed for {ip}: {e}"),
            }
        }
        log::info!("Phase 2 complete: enriched {enriched} devices with port data");

        // ---- Decoy auto-deploy (only when no decoys exist) ----
        let orchestrator = self.orchestrator.lock().unwrap().clone();
        if let Some(orchestrator) = orchestrator {
            let discovered: Vec<DiscoveredService> = port_results
                .iter()
                .flat_map(|(ip, results)| {
                    results.iter().map(|r| DiscoveredService {
                        ip: ip.clone(),
                        port: r.port,
                        protocol: "tcp".to_string(),
                    })
                })
                .collect();
            match orchestrator.auto_deploy(&discovered).await {
                Ok(0) => {}
                Ok(deployed) => log::info!("Auto-deployed {deployed} decoys from scan results"),
                Err(e) => log::error!("Decoy auto-deploy failed: {e}"),
            }
        }

        // ---- Phase 2.5: security insight analysis ----
        if let Some(analyzer) = &self.security_analyzer {
            let exposures: Vec<DeviceExposure> = self
                .manager
                .get_known_devices()
                .into_iter()
                .filter(|device| !device.open_ports.is_empty())
                .map(|device| DeviceExposure {
                    device_id: device.device_id,
                    display_name: device
                        .hostname
                        .clone()
                        .unwrap_or_else(|| device.ip_address.clone()),
                    ip_address: device.ip_address,
                    open_ports: device.open_ports,
                })
                .collect();
            if !exposures.is_empty() {
                match analyzer.analyze_all_devices(&exposures).await {
                    Ok(0) => {}
                    Ok(alerts) => {
                        log::info!("Phase 2.5 complete: {alerts} security insight alerts")
                    }
                    Err(e) => log::error!("Security insight analysis failed: {e}"),
                }
            }
        }

        // ---- Phase 3: HA enrichment or mDNS/SSDP fallback ----
        match self.current_ha_client() {
            Some(client) => {
                let enrich =
                    async {
                        let (devices, areas) =
                            tokio::try_join!(client.get_devices(), client.get_areas())?;
                        self.manager.enrich_device_ha(&devices, &areas).await?;
                        Ok::<(usize, usize), crate::error::SensorError>((
                            devices.len(),
                            areas.len(),
                        ))
                    };
                match enrich.await {
                    Ok((devices, areas)) => {
                        log::info!(
                            "Phase 3 complete: enriched from HA ({devices} devices, {areas} areas)"
                        );
                    }
                    Err(e) => {
                        log::warn!("HA enrichment failed, falling back to mDNS/SSDP: {e}");
                        self.run_discovery_enrichment().await;
                    }
                }
            }
            None => self.run_discovery_enrichment().await,
        }

        // ---- Publish scan complete ----
        let device_count = self.manager.get_known_devices().len();
        self.bus
            .publish(
                types::SYSTEM_SCAN_COMPLETE,
                json!({
                    "scan_id": scan_id.to_string(),
                    "device_count": device_count,
                    "scan_duration_ms": started.elapsed().as_millis() as u64,
                    "hosts_discovered": arp_results.len(),
                }),
                None,
            )
            .await?;

        log::info!(
            "Scan cycle complete: {device_count} devices tracked in {}ms",
            started.elapsed().as_millis()
        );
        Ok(())
    }

    /// Deal with ARP hits on our own aliased virtual IPs: answers from
    /// the sensor's own MAC are mimics doing their job; any other MAC
    /// means a real device moved in and the mimic must evacuate. Either
    /// way those IPs are excluded from device processing.
    async fn handle_virtual_ip_hits(&self, arp_results: &[(String, String)]) -> HashSet<String> {
        let aliased: HashSet<String> = {
            match self.pool.get() {
                Ok(conn) => db_vips::list_by_state(&conn, "aliased")
                    .map(|rows| rows.into_iter().map(|r| r.ip_address).collect())
                    .unwrap_or_default(),
                Err(_) => HashSet::new(),
            }
        };
        if aliased.is_empty() {
            return aliased;
        }

        // The sensor's own MAC is whatever answers for its primary IP.
        let sensor_mac: Option<String> = detect_local_ip().and_then(|local_ip| {
            let local = local_ip.to_string();
            arp_results
                .iter()
                .find(|(ip, _)| *ip == local)
                .map(|(_, mac)| mac.clone())
        });

        for (ip, mac) in arp_results {
            if !aliased.contains(ip) {
                continue;
            }
            let foreign = sensor_mac
                .as_deref()
                .is_some_and(|own| !own.eq_ignore_ascii_case(mac));
            if foreign {
                let mimics = self.mimic_orchestrator.lock().unwrap().clone();
                if let Some(mimics) = mimics {
                    if let Err(e) = mimics.handle_ip_conflict(ip).await {
                        log::error!("IP conflict handling failed for {ip}: {e}");
                    }
                }
            }
        }
        aliased
    }

    async fn run_discovery_enrichment(&self) {
        let (mdns_results, ssdp_results) = tokio::join!(self.mdns.browse(), self.ssdp.scan());

        let mdns_results = match mdns_results {
            Ok(results) => results,
            Err(e) => {
                log::warn!("mDNS browse failed: {e}");
                Vec::new()
            }
        };
        let ssdp_results = match ssdp_results {
            Ok(results) => results,
            Err(e) => {
                log::warn!("SSDP scan failed: {e}");
                Vec::new()
            }
        };

        let mut all_ips: HashSet<String> = HashSet::new();
        all_ips.extend(mdns_results.iter().map(|r| r.ip.clone()));
        all_ips.extend(ssdp_results.iter().map(|r| r.ip.clone()));

        let mut enriched = 0usize;
        for ip in all_ips {
            let mdns = mdns_results.iter().find(|r| r.ip == ip);
            let ssdp = ssdp_results.iter().find(|r| r.ip == ip);
            let result = self
                .manager
                .enrich_device_discovery(
                    &ip,
                    mdns.map(|r| r.hostname.as_str()),
                    ssdp.and_then(|r| r.friendly_name.as_deref()),
                    ssdp.and_then(|r| r.manufacturer.as_deref()),
                    ssdp.and_then(|r| r.model_name.as_deref()),
                )
                .await;
            match result {
                Ok(()) => enriched += 1,
                Err(e) => log::error!("Discovery enrichment failed for {ip}: {e}"),
            }
        }
        log::info!("Phase 3 complete: enriched {enriched} devices with discovery data");
    }

    /// Live HA client. Re-reads config each cycle so runtime changes take
    /// effect: rebuilds the client when the URL or token changed, drops
    /// it when HA was disabled.
    fn current_ha_client(&self) -> Option<Arc<HomeAssistantClient>> {
        let ha_config = {
            let config = self.live_config.read().unwrap();
            config.home_assistant.clone()
        };
        let mut state = self.ha_state.lock().unwrap();

        if !ha_config.is_usable() {
            if state.client.is_some() {
                log::info!("Home Assistant disabled at runtime, discarding client");
                *state = HaState::default();
            }
            return None;
        }

        let changed = state.client.is_none()
            || state.url != ha_config.url
            || state.token != ha_config.token;
        if changed {
            log::info!("HA client created/updated from live config: {}", ha_config.url);
            state.client = Some(Arc::new(HomeAssistantClient::new(
                &ha_config.url,
                &ha_config.token,
            )));
            state.url = ha_config.url;
            state.token = ha_config.token;
        }
        state.client.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::decoys::canary::CanaryManager;
    use crate::devices::classifier::DeviceClassifier;
    use crate::devices::signatures::SignatureDb;
    use crate::events::EventLog;
    use crate::privileged::{DnsQuery, PortForwardRule, ServiceScanResult};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex as StdMutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    struct ScriptedOps {
        arp_results: StdMutex<Vec<(String, String)>>,
        fail_arp: StdMutex<bool>,
    }

    #[async_trait]
    impl PrivilegedOps for ScriptedOps {
        async fn arp_scan(&self, _subnet: &str) -> crate::error::Result<Vec<(String, String)>> {
            if *self.fail_arp.lock().unwrap() {
                return Err(crate::error::SensorError::Privileged("arp down".to_string()));
            }
            Ok(self.arp_results.lock().unwrap().clone())
        }
        async fn service_scan(
            &self,
            _t: &[String],
            _p: &[u16],
        ) -> crate::error::Result<Vec<ServiceScanResult>> {
            Ok(Vec::new())
        }
        async fn bind_listener(&self, a: &str, p: u16) -> crate::error::Result<std::net::TcpListener> {
            Ok(std::net::TcpListener::bind((a, p))?)
        }
        async fn start_dns_sniff(&self, _i: &str) -> crate::error::Result<()> {
            Ok(())
        }
        async fn stop_dns_sniff(&self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn get_dns_queries(&self, _s: DateTime<Utc>) -> crate::error::Result<Vec<DnsQuery>> {
            Ok(Vec::new())
        }
        async fn add_ip_alias(&self, _ip: &str, _i: &str, _m: &str) -> crate::error::Result<bool> {
            Ok(true)
        }
        async fn remove_ip_alias(&self, _ip: &str, _i: &str) -> crate::error::Result<bool> {
            Ok(true)
        }
        async fn setup_port_forwards(
            &self,
            _r: &[PortForwardRule],
            _i: &str,
        ) -> crate::error::Result<bool> {
            Ok(true)
        }
        async fn clear_port_forwards(&self) -> crate::error::Result<bool> {
            Ok(true)
        }
    }

    struct Fixture {
        scan_loop: ScanLoop,
        bus: Arc<EventBus>,
        pool: DbPool,
        ops: Arc<ScriptedOps>,
    }

    fn fixture(arp_results: Vec<(String, String)>, scan_ports: Vec<u16>) -> Fixture {
        let pool = db::init_test_db();
        let bus = Arc::new(EventBus::new(EventLog::new(pool.clone())));
        let classifier = DeviceClassifier::new(SignatureDb::bundled(), None);
        let manager = Arc::new(DeviceManager::new(pool.clone(), bus.clone(), classifier));
        let ops = Arc::new(ScriptedOps {
            arp_results: StdMutex::new(arp_results),
            fail_arp: StdMutex::new(false),
        });

        let mut config = Config::default();
        config.network.subnet = "127.0.0.0/8".to_string();
        config.network.scan_ports = scan_ports;
        let live_config = Arc::new(RwLock::new(config));

        let scan_loop = ScanLoop::new(
            manager,
            bus.clone(),
            ops.clone(),
            pool.clone(),
            live_config,
            PortScanner::default(),
            MdnsBrowser::new(Duration::from_millis(100)),
            SsdpScanner::new(Duration::from_millis(100)),
            None,
        );
        Fixture {
            scan_loop,
            bus,
            pool,
            ops,
        }
    }

    #[tokio::test]
    async fn test_cycle_creates_devices_and_publishes_complete() {
        let fixture = fixture(
            vec![("127.0.0.1".to_string(), "a4:83:e7:11:22:33".to_string())],
            vec![1], // port 1: almost certainly closed
        );
        fixture.scan_loop.run_single_scan().await.unwrap();

        let conn = fixture.pool.get().unwrap();
        let devices: i64 = conn
            .query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))
            .unwrap();
        assert_eq!(devices, 1);
        drop(conn);

        let events = fixture.bus.replay(0).unwrap();
        assert!(events.iter().any(|e| e.event_type == "device.new"));
        let complete = events
            .iter()
            .find(|e| e.event_type == "system.scan_complete")
            .unwrap();
        assert_eq!(complete.payload["device_count"].as_i64(), Some(1));
        assert_eq!(complete.payload["hosts_discovered"].as_i64(), Some(1));
        assert!(complete.payload["scan_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_arp_failure_publishes_zero_count_and_returns() {
        let fixture = fixture(Vec::new(), vec![1]);
        *fixture.ops.fail_arp.lock().unwrap() = true;

        fixture.scan_loop.run_single_scan().await.unwrap();

        let events = fixture.bus.replay(0).unwrap();
        let complete = events
            .iter()
            .find(|e| e.event_type == "system.scan_complete")
            .unwrap();
        assert_eq!(complete.payload["device_count"].as_i64(), Some(0));
        // Phase 1 aborted before discovering hosts.
        assert!(complete.payload["hosts_discovered"].is_null());
    }

    #[tokio::test]
    async fn test_phase2_enriches_open_ports() {
        // A live listener on an ephemeral port simulates an open service.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let _ = socket.write_all(b"220 test service\r\n").await;
            }
        });

        let fixture = fixture(
            vec![("127.0.0.1".to_string(), "dc:a6:32:01:02:03".to_string())],
            vec![port],
        );
        fixture.scan_loop.run_single_scan().await.unwrap();

        let conn = fixture.pool.get().unwrap();
        let open_ports: i64 = conn
            .query_row("SELECT COUNT(*) FROM device_open_ports", [], |row| row.get(0))
            .unwrap();
        assert_eq!(open_ports, 1);
        let banner: Option<String> = conn
            .query_row("SELECT banner FROM device_open_ports", [], |row| row.get(0))
            .unwrap();
        assert_eq!(banner.as_deref(), Some("220 test service"));
    }

    #[tokio::test]
    async fn test_auto_deploy_wired_through_cycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let fixture = fixture(
            vec![("127.0.0.1".to_string(), "dc:a6:32:01:02:03".to_string())],
            vec![port],
        );
        let orchestrator = Arc::new(DecoyOrchestrator::new(
            fixture.bus.clone(),
            fixture.pool.clone(),
            Arc::new(CanaryManager::empty()),
            "squirrelops.io",
            4,
        ));
        fixture.scan_loop.set_orchestrator(orchestrator.clone());

        fixture.scan_loop.run_single_scan().await.unwrap();

        // Something open was discovered, no decoys existed, so the
        // fallback file share (at minimum) was deployed.
        let conn = fixture.pool.get().unwrap();
        let decoys: i64 = conn
            .query_row("SELECT COUNT(*) FROM decoys", [], |row| row.get(0))
            .unwrap();
        assert!(decoys >= 1);
        drop(conn);
        orchestrator.stop_all().await;

        // Second cycle: decoys exist, auto-deploy is a no-op.
        fixture.scan_loop.run_single_scan().await.unwrap();
        let conn = fixture.pool.get().unwrap();
        let decoys_after: i64 = conn
            .query_row("SELECT COUNT(*) FROM decoys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(decoys, decoys_after);
    }

    #[test]
    fn test_ha_client_lifecycle_follows_live_config() {
        let fixture = fixture(Vec::new(), vec![1]);
        assert!(fixture.scan_loop.current_ha_client().is_none());

        {
            let mut config = fixture.scan_loop.live_config.write().unwrap();
            config.home_assistant.enabled = true;
            config.home_assistant.url = "http://ha.local:8123".to_string();
            config.home_assistant.token = "token-1".to_string();
        }
        let first = fixture.scan_loop.current_ha_client().unwrap();
        assert_eq!(first.url(), "http://ha.local:8123");

        // Token change rebuilds the client.
        {
            let mut config = fixture.scan_loop.live_config.write().unwrap();
            config.home_assistant.token = "token-2".to_string();
        }
        let second = fixture.scan_loop.current_ha_client().unwrap();
        assert_eq!(second.token(), "token-2");
        assert!(!Arc::ptr_eq(&first, &second));

        // Disabling drops the client.
        {
            let mut config = fixture.scan_loop.live_config.write().unwrap();
            config.home_assistant.enabled = false;
        }
        assert!(fixture.scan_loop.current_ha_client().is_none());
    }
}
