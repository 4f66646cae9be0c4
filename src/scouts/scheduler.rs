use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::db::DbPool;
use crate::error::Result;
use crate::scouts::engine::ScoutEngine;
use crate::scouts::mimic_orchestrator::MimicOrchestrator;

/// Periodic driver for the scout-to-mimic pipeline: every interval, deep
/// scout all devices with known open ports, then let the mimic
/// orchestrator evaluate and deploy clones.
pub struct ScoutScheduler {
    engine: Arc<ScoutEngine>,
    mimics: Arc<MimicOrchestrator>,
    pool: DbPool,
    interval: Duration,
}

impl ScoutScheduler {
    pub fn new(
        engine: Arc<ScoutEngine>,
        mimics: Arc<MimicOrchestrator>,
        pool: DbPool,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            mimics,
            pool,
            interval,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        log::info!(
            "Scout scheduler started: interval={}s",
            self.interval.as_secs()
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            match self.run_once().await {
                Ok((profiles, mimics)) => {
                    log::info!("Scout cycle complete: {profiles} profiles, {mimics} new mimics");
                }
                Err(e) => log::error!("Scout cycle failed: {e}"),
            }
        }
        log::info!("Scout scheduler stopped");
    }

    /// One scout pass. Returns (profiles written, mimics deployed).
    pub async fn run_once(&self) -> Result<(usize, usize)> {
        let targets = self.scout_targets()?;
        if targets.is_empty() {
            return Ok((0, 0));
        }

        let profiles = self.engine.scout_all(&targets).await?;
        let mimics = self.mimics.evaluate_and_deploy().await?;
        Ok((profiles, mimics))
    }

    /// Devices with known open ports, from persisted scan state.
    fn scout_targets(&self) -> Result<Vec<(i64, String, Vec<u16>)>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT d.id, d.ip_address, p.port
             FROM devices d
             JOIN device_open_ports p ON p.device_id = d.id
             ORDER BY d.id, p.port",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u16>(2)?,
            ))
        })?;

        let mut grouped: HashMap<i64, (String, Vec<u16>)> = HashMap::new();
        for row in rows {
            let (device_id, ip, port) = row?;
            grouped.entry(device_id).or_insert_with(|| (ip, Vec::new())).1.push(port);
        }
        Ok(grouped
            .into_iter()
            .map(|(device_id, (ip, ports))| (device_id, ip, ports))
            .collect())
    }
}
