use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::privileged::{PortForwardRule, PrivilegedOps};

/// Offset added to privileged ports so the mimic can bind unprivileged.
const REMAP_OFFSET: u16 = 10000;

/// True when a port needs a DNAT remap to be served unprivileged.
pub fn needs_remap(port: u16) -> bool {
    port < 1024
}

/// High port a privileged port is remapped to.
pub fn remap_port(port: u16) -> u16 {
    port + REMAP_OFFSET
}

/// Owner of the sensor's DNAT rule chain. Tracks rules per decoy and
/// re-applies the full set whenever it changes; teardown flushes only the
/// sensor's own chain.
pub struct PortForwardManager {
    ops: Arc<dyn PrivilegedOps>,
    interface: String,
    rules_by_decoy: Mutex<HashMap<i64, Vec<PortForwardRule>>>,
}

impl PortForwardManager {
    pub fn new(ops: Arc<dyn PrivilegedOps>, interface: &str) -> Self {
        Self {
            ops,
            interface: interface.to_string(),
            rules_by_decoy: Mutex::new(HashMap::new()),
        }
    }

    /// Install DNAT rules for a decoy's privileged-port remaps
    /// (`virtual_ip:port -> virtual_ip:port+10000`).
    pub async fn add_forwards(
        &self,
        decoy_id: i64,
        virtual_ip: &str,
        remaps: &HashMap<u16, u16>,
    ) -> Result<bool> {
        let rules: Vec<PortForwardRule> = remaps
            .iter()
            .map(|(from_port, to_port)| PortForwardRule {
                from_ip: virtual_ip.to_string(),
                from_port: *from_port,
                to_ip: virtual_ip.to_string(),
                to_port: *to_port,
            })
            .collect();

        let mut by_decoy = self.rules_by_decoy.lock().await;
        by_decoy.insert(decoy_id, rules);
        self.apply_all(&by_decoy).await
    }

    /// Drop a decoy's rules and re-apply the remainder.
    pub async fn remove_forwards(&self, decoy_id: i64) -> Result<bool> {
        let mut by_decoy = self.rules_by_decoy.lock().await;
        if by_decoy.remove(&decoy_id).is_none() {
            return Ok(true);
        }
        if by_decoy.is_empty() {
            return self.ops.clear_port_forwards().await;
        }
        self.apply_all(&by_decoy).await
    }

    /// Flush the sensor's chain entirely (shutdown).
    pub async fn clear_all(&self) -> Result<bool> {
        self.rules_by_decoy.lock().await.clear();
        self.ops.clear_port_forwards().await
    }

    async fn apply_all(&self, by_decoy: &HashMap<i64, Vec<PortForwardRule>>) -> Result<bool> {
        let all: Vec<PortForwardRule> = by_decoy.values().flatten().cloned().collect();
        self.ops.setup_port_forwards(&all, &self.interface).await
    }
}
