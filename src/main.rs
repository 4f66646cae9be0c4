use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use squirrelops_sensor::alerts::dispatcher::AlertDispatcher;
use squirrelops_sensor::alerts::engine::AlertEngine;
use squirrelops_sensor::alerts::incidents::IncidentGrouper;
use squirrelops_sensor::alerts::insights::SecurityInsightAnalyzer;
use squirrelops_sensor::config::Config;
use squirrelops_sensor::db;
use squirrelops_sensor::db::queries::{credentials as db_credentials, retention};
use squirrelops_sensor::decoys::canary::CanaryManager;
use squirrelops_sensor::decoys::orchestrator::DecoyOrchestrator;
use squirrelops_sensor::devices::classifier::DeviceClassifier;
use squirrelops_sensor::devices::llm::OpenAiCompatibleClassifier;
use squirrelops_sensor::devices::manager::DeviceManager;
use squirrelops_sensor::devices::signatures::SignatureDb;
use squirrelops_sensor::events::{EventBus, EventLog};
use squirrelops_sensor::integrations::home_assistant::HomeAssistantClient;
use squirrelops_sensor::network::interface::{detect_local_ip, gateway_of, resolve_subnet};
use squirrelops_sensor::network::port_forward::PortForwardManager;
use squirrelops_sensor::network::virtual_ip::{IpAllocator, VirtualIpManager};
use squirrelops_sensor::privileged::linux::LinuxPrivilegedOps;
use squirrelops_sensor::privileged::PrivilegedOps;
use squirrelops_sensor::scanner::dns::DnsCanaryMonitor;
use squirrelops_sensor::scanner::mdns::MdnsBrowser;
use squirrelops_sensor::scanner::port::PortScanner;
use squirrelops_sensor::scanner::scan_loop::ScanLoop;
use squirrelops_sensor::scanner::ssdp::SsdpScanner;
use squirrelops_sensor::scouts::engine::ScoutEngine;
use squirrelops_sensor::scouts::mdns::MimicMdnsAdvertiser;
use squirrelops_sensor::scouts::mimic_orchestrator::MimicOrchestrator;
use squirrelops_sensor::scouts::scheduler::ScoutScheduler;

const RETENTION_TICK: Duration = Duration::from_secs(24 * 60 * 60);
const RETENTION_STARTUP_DELAY: Duration = Duration::from_secs(5 * 60);
const INCIDENT_CLOSER_TICK: Duration = Duration::from_secs(60);
const DECOY_HEALTH_TICK: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn parse_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => return args.next().map(PathBuf::from),
            "--help" | "-h" => {
                eprintln!("usage: squirrelops-sensor [--config PATH]");
                std::process::exit(0);
            }
            other => {
                eprintln!("unknown argument: {other}");
                std::process::exit(2);
            }
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config_path = parse_args();
    let config =
        Config::load(config_path.as_deref()).context("failed to load configuration")?;
    let live_config = Arc::new(RwLock::new(config.clone()));

    // Database + event bus.
    let pool = db::init_db(Path::new(&config.sensor.data_dir)).context("database init failed")?;
    let bus = Arc::new(EventBus::new(EventLog::new(pool.clone())));

    // Classifier: bundled signatures, optional OUI CSV extension, optional
    // LLM fallback.
    let mut signatures = SignatureDb::bundled();
    let oui_csv = Path::new(&config.sensor.data_dir).join("oui.csv");
    if oui_csv.exists() {
        if let Err(e) = signatures.extend_from_oui_csv(&oui_csv) {
            log::warn!("Failed to load OUI CSV: {e}");
        }
    }
    let llm = match (&config.classifier.llm_endpoint, &config.classifier.llm_model) {
        (Some(endpoint), Some(model)) => {
            log::info!("LLM classifier enabled: {endpoint} (model: {model})");
            Some(OpenAiCompatibleClassifier::new(
                endpoint,
                model,
                config.classifier.llm_api_key.as_deref(),
            ))
        }
        _ => None,
    };
    let classifier = DeviceClassifier::new(signatures, llm);

    // Device manager + privileged ops.
    let manager = Arc::new(DeviceManager::new(pool.clone(), bus.clone(), classifier));
    let ops: Arc<dyn PrivilegedOps> = Arc::new(LinuxPrivilegedOps::new());

    // Canary manager, seeded from persisted credentials.
    let canary = Arc::new(CanaryManager::empty());
    {
        let conn = pool.get()?;
        for (hostname, credential_id) in db_credentials::list_canary_hostnames(&conn)? {
            canary.register_credential(&hostname, credential_id);
        }
    }
    log::info!("Canary manager seeded with {} hostnames", canary.len());

    // Alert pipeline: engine -> incidents -> dispatcher, all event-driven.
    let alert_engine = Arc::new(AlertEngine::new(pool.clone(), bus.clone()));
    AlertEngine::subscribe(alert_engine, &bus);
    let grouper = Arc::new(IncidentGrouper::new(
        pool.clone(),
        bus.clone(),
        config.alerts.incident_window_minutes,
        config.alerts.incident_close_window_minutes,
    ));
    IncidentGrouper::subscribe(grouper.clone(), &bus);
    let dispatcher = Arc::new(AlertDispatcher::from_config(&config.alerts));
    AlertDispatcher::subscribe(dispatcher, &bus);

    // Decoy orchestrator.
    let orchestrator = Arc::new(DecoyOrchestrator::new(
        bus.clone(),
        pool.clone(),
        canary.clone(),
        &config.canary.apex_domain,
        config.decoys.max_decoys,
    ));

    // Scouts subsystem.
    let subnet = resolve_subnet(&config.network.subnet);
    let scouts = if config.scouts.enabled {
        let allocator = IpAllocator::new(
            &subnet,
            gateway_of(&subnet),
            detect_local_ip(),
            config.scouts.virtual_ip_range_start,
            config.scouts.virtual_ip_range_end,
        )?;
        let ip_manager = Arc::new(VirtualIpManager::new(
            ops.clone(),
            allocator,
            pool.clone(),
            &config.network.interface,
        ));
        let port_forwards = Arc::new(PortForwardManager::new(
            ops.clone(),
            &config.network.interface,
        ));
        let mimic_mdns = Arc::new(MimicMdnsAdvertiser::new());
        let engine = Arc::new(ScoutEngine::new(
            pool.clone(),
            config.scouts.max_concurrent_probes,
        ));
        let mimics = Arc::new(MimicOrchestrator::new(
            engine.clone(),
            ip_manager.clone(),
            bus.clone(),
            pool.clone(),
            canary.clone(),
            &config.canary.apex_domain,
            config.scouts.max_mimic_decoys,
            Some(mimic_mdns.clone()),
            Some(port_forwards.clone()),
        ));
        let scheduler = Arc::new(ScoutScheduler::new(
            engine,
            mimics.clone(),
            pool.clone(),
            Duration::from_secs(config.scouts.interval_minutes * 60),
        ));
        log::info!(
            "Scouts initialized: interval={}m, max_mimics={}, ip_range=.{}-.{}",
            config.scouts.interval_minutes,
            config.scouts.max_mimic_decoys,
            config.scouts.virtual_ip_range_start,
            config.scouts.virtual_ip_range_end
        );
        Some((scheduler, mimics, ip_manager, port_forwards, mimic_mdns))
    } else {
        log::info!("Scouts disabled in config");
        None
    };

    // Optional eager HA connectivity check, purely informational.
    if config.home_assistant.is_usable() {
        let client = HomeAssistantClient::new(&config.home_assistant.url, &config.home_assistant.token);
        match client.check_connectivity().await {
            Ok(()) => log::info!("Home Assistant reachable at {}", config.home_assistant.url),
            Err(e) => log::warn!("Home Assistant connectivity check failed: {e}"),
        }
    }

    // Scan loop with phase 2.5 analyzer; decoy orchestrator injected
    // one-way for auto-deploy.
    let analyzer = SecurityInsightAnalyzer::new(pool.clone(), bus.clone());
    let scan_loop = Arc::new(ScanLoop::new(
        manager.clone(),
        bus.clone(),
        ops.clone(),
        pool.clone(),
        live_config.clone(),
        PortScanner::default(),
        MdnsBrowser::default(),
        SsdpScanner::default(),
        Some(analyzer),
    ));
    scan_loop.set_orchestrator(orchestrator.clone());

    // Startup order: resume decoys first, restore virtual IPs and mimics,
    // then start scanning.
    match orchestrator.resume_active().await {
        Ok(0) => {}
        Ok(resumed) => log::info!("Resumed {resumed} decoys at startup"),
        Err(e) => log::error!("Failed to resume decoys at startup: {e}"),
    }

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    // The scan loop and scout scheduler keep their own handles: shutdown
    // must wait for their in-flight cycles before tearing down the
    // orchestrators they feed.
    let mut scheduler_task = None;

    if let Some((scheduler, mimics, ip_manager, _port_forwards, mimic_mdns)) = &scouts {
        if let Err(e) = mimic_mdns.start() {
            log::warn!("mDNS advertiser unavailable: {e}");
        }
        match ip_manager.restore_from_db().await {
            Ok(0) => {}
            Ok(restored) => log::info!("Restored {restored} virtual IP aliases"),
            Err(e) => log::error!("Failed to restore virtual IP aliases: {e}"),
        }
        match mimics.resume_active().await {
            Ok(0) => {}
            Ok(resumed) => log::info!("Resumed {resumed} mimic decoys"),
            Err(e) => log::error!("Failed to resume mimic decoys: {e}"),
        }
        scan_loop.set_mimic_orchestrator(mimics.clone());

        let scheduler = scheduler.clone();
        let token = shutdown.clone();
        scheduler_task = Some(tokio::spawn(async move { scheduler.run(token).await }));
    }

    // Scan loop task.
    let mut scan_task = {
        let scan_loop = scan_loop.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { scan_loop.run(token).await })
    };

    // Decoy health loop.
    {
        let orchestrator = orchestrator.clone();
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            orchestrator.run_health_loop(token, DECOY_HEALTH_TICK).await
        }));
    }

    // DNS canary monitor.
    {
        let monitor = DnsCanaryMonitor::new(
            ops.clone(),
            canary.clone(),
            bus.clone(),
            pool.clone(),
            Duration::from_secs(config.canary.poll_interval_secs),
        );
        let interface = config.network.interface.clone();
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            monitor.run(&interface, token).await
        }));
    }

    // Incident closer.
    {
        let grouper = grouper.clone();
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            grouper.run_closer(token, INCIDENT_CLOSER_TICK).await
        }));
    }

    // Retention purge: once shortly after startup, then daily.
    {
        let pool = pool.clone();
        let retention_days = config.alerts.retention_days;
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut next_tick = RETENTION_STARTUP_DELAY;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(next_tick) => {}
                }
                next_tick = RETENTION_TICK;
                match pool.get() {
                    Ok(conn) => match retention::purge_old_records(&conn, retention_days) {
                        Ok(counts) => {
                            let total: usize = counts.values().sum();
                            if total > 0 {
                                log::info!("Retention purge removed {total} rows: {counts:?}");
                            }
                        }
                        Err(e) => log::warn!("Retention purge failed: {e}"),
                    },
                    Err(e) => log::warn!("Retention purge could not get connection: {e}"),
                }
            }
        }));
    }

    log::info!("Sensor running on subnet {subnet}; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.ok();
    log::info!("Shutdown signal received; stopping sensor");

    // Graceful shutdown, in dependency order. Cancellation only signals
    // the loops; each producer task is awaited to completion before the
    // orchestrators it feeds are torn down, so no scan or scout cycle can
    // allocate IPs or forward rules after cleanup has run.
    shutdown.cancel();

    if let Some((_, _, _, _, mimic_mdns)) = &scouts {
        log::info!("Stopping mimic mDNS advertiser...");
        mimic_mdns.stop();
    }

    log::info!("Stopping scan loop...");
    if tokio::time::timeout(SHUTDOWN_GRACE, &mut scan_task).await.is_err() {
        log::warn!("Scan loop did not finish within {SHUTDOWN_GRACE:?}, aborting");
        scan_task.abort();
    }

    if let Some(mut task) = scheduler_task {
        log::info!("Stopping scout scheduler...");
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            log::warn!("Scout scheduler did not finish within {SHUTDOWN_GRACE:?}, aborting");
            task.abort();
        }
    }

    if let Some((_, mimics, _, _, _)) = &scouts {
        // Owns the full mimics -> virtual IPs -> forward rules teardown.
        log::info!("Stopping mimic orchestrator...");
        if let Err(e) = mimics.stop_all().await {
            log::warn!("Mimic shutdown error: {e}");
        }
    }

    log::info!("Stopping decoy orchestrator...");
    orchestrator.stop_all().await;

    log::info!("Waiting for background tasks...");
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        log::warn!("Background tasks did not stop within {SHUTDOWN_GRACE:?}");
    }

    log::info!("Sensor shutdown complete");
    Ok(())
}
