use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crate::db::queries::virtual_ips as db_vips;
use crate::db::DbPool;
use crate::error::{Result, SensorError};
use crate::privileged::PrivilegedOps;
use crate::timefmt;

/// Allocates virtual IPs from a bounded host-number range on the sensor's
/// subnet, skipping the gateway and the sensor's own address.
pub struct IpAllocator {
    candidates: Vec<Ipv4Addr>,
    taken: Mutex<HashSet<Ipv4Addr>>,
}

impl IpAllocator {
    pub fn new(
        subnet: &str,
        gateway_ip: Option<Ipv4Addr>,
        sensor_ip: Option<Ipv4Addr>,
        range_start: u8,
        range_end: u8,
    ) -> Result<Self> {
        let (base, _prefix) = subnet
            .split_once('/')
            .ok_or_else(|| SensorError::Config(format!("invalid subnet: {subnet}")))?;
        let base: Ipv4Addr = base
            .parse()
            .map_err(|_| SensorError::Config(format!("invalid subnet: {subnet}")))?;
        let octets = base.octets();

        let candidates = (range_start..=range_end)
            .map(|host| Ipv4Addr::new(octets[0], octets[1], octets[2], host))
            .filter(|ip| Some(*ip) != gateway_ip && Some(*ip) != sensor_ip)
            .collect();

        Ok(Self {
            candidates,
            taken: Mutex::new(HashSet::new()),
        })
    }

    /// Reserve the next free IP, or None when the pool is exhausted.
    pub fn allocate(&self) -> Option<Ipv4Addr> {
        let mut taken = self.taken.lock().unwrap();
        let ip = self.candidates.iter().find(|ip| !taken.contains(ip))?;
        taken.insert(*ip);
        Some(*ip)
    }

    pub fn release(&self, ip: Ipv4Addr) {
        self.taken.lock().unwrap().remove(&ip);
    }

    /// Mark an IP as taken (used when restoring persisted allocations).
    pub fn reserve(&self, ip: Ipv4Addr) {
        self.taken.lock().unwrap().insert(ip);
    }

    pub fn available(&self) -> usize {
        let taken = self.taken.lock().unwrap();
        self.candidates.iter().filter(|ip| !taken.contains(ip)).count()
    }
}

/// Owner of the virtual IP pool. The only component that invokes IP-alias
/// privileged operations.
///
/// Ownership transfers are exactly:
/// free -> allocated (reserved) -> aliased (OS-installed) -> free, with
/// allocated -> free on rollback when the alias fails.
pub struct VirtualIpManager {
    ops: Arc<dyn PrivilegedOps>,
    allocator: IpAllocator,
    pool: DbPool,
    interface: String,
}

impl VirtualIpManager {
    pub fn new(
        ops: Arc<dyn PrivilegedOps>,
        allocator: IpAllocator,
        pool: DbPool,
        interface: &str,
    ) -> Self {
        Self {
            ops,
            allocator,
            pool,
            interface: interface.to_string(),
        }
    }

    /// Allocate a free IP and install its alias. Returns the aliased IP,
    /// or an error (pool exhausted / alias failed, with the reservation
    /// rolled back).
    pub async fn acquire(&self) -> Result<Ipv4Addr> {
        let ip = self.allocator.allocate().ok_or(SensorError::IpPoolExhausted)?;
        let ip_str = ip.to_string();

        {
            let conn = self.pool.get()?;
            db_vips::upsert_state(&conn, &ip_str, &self.interface, "allocated", &timefmt::now_iso())?;
        }

        let ok = self
            .ops
            .add_ip_alias(&ip_str, &self.interface, "255.255.255.0")
            .await?;
        if !ok {
            // Roll back the reservation: allocated -> free.
            self.allocator.release(ip);
            let conn = self.pool.get()?;
            db_vips::delete(&conn, &ip_str)?;
            return Err(SensorError::Privileged(format!(
                "failed to add IP alias {ip_str}"
            )));
        }

        {
            let conn = self.pool.get()?;
            db_vips::upsert_state(&conn, &ip_str, &self.interface, "aliased", &timefmt::now_iso())?;
        }
        Ok(ip)
    }

    /// Remove the alias and return the IP to the pool: aliased -> free.
    pub async fn release(&self, ip: &str) -> Result<()> {
        if let Ok(parsed) = ip.parse::<Ipv4Addr>() {
            self.allocator.release(parsed);
        }
        let _ = self.ops.remove_ip_alias(ip, &self.interface).await?;
        let conn = self.pool.get()?;
        db_vips::delete(&conn, ip)?;
        Ok(())
    }

    /// Link an aliased IP to its owning decoy.
    pub fn link_decoy(&self, ip: &str, decoy_id: i64) -> Result<()> {
        let conn = self.pool.get()?;
        db_vips::link_decoy(&conn, ip, Some(decoy_id))?;
        Ok(())
    }

    /// Re-install a single known alias (mimic restart). Reserves the IP
    /// in the pool and records it as aliased. True on success.
    pub async fn restore_single(&self, ip: Ipv4Addr) -> Result<bool> {
        self.allocator.reserve(ip);
        let ip_str = ip.to_string();
        let ok = self
            .ops
            .add_ip_alias(&ip_str, &self.interface, "255.255.255.0")
            .await?;
        if ok {
            let conn = self.pool.get()?;
            db_vips::upsert_state(&conn, &ip_str, &self.interface, "aliased", &timefmt::now_iso())?;
        } else {
            self.allocator.release(ip);
        }
        Ok(ok)
    }

    /// Restore aliases recorded as aliased in the database (startup).
    /// Returns the number restored.
    pub async fn restore_from_db(&self) -> Result<usize> {
        let rows = {
            let conn = self.pool.get()?;
            db_vips::list_by_state(&conn, "aliased")?
        };

        let mut restored = 0usize;
        for row in rows {
            if let Ok(ip) = row.ip_address.parse::<Ipv4Addr>() {
                self.allocator.reserve(ip);
            }
            match self
                .ops
                .add_ip_alias(&row.ip_address, &self.interface, "255.255.255.0")
                .await
            {
                Ok(true) => restored += 1,
                Ok(false) | Err(_) => {
                    log::warn!("Failed to restore IP alias {}", row.ip_address);
                }
            }
        }
        Ok(restored)
    }

    /// Remove every alias the sensor owns (shutdown). Returns the count.
    pub async fn remove_all(&self) -> Result<usize> {
        let rows = {
            let conn = self.pool.get()?;
            db_vips::list_by_state(&conn, "aliased")?
        };
        let mut removed = 0usize;
        for row in rows {
            if self.release(&row.ip_address).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db;
    use crate::privileged::{DnsQuery, PortForwardRule, ServiceScanResult};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Mock ops that records alias calls and can be told to fail them.
    pub(crate) struct MockOps {
        pub fail_alias: AtomicBool,
        pub aliases: Mutex<Vec<String>>,
    }

    impl MockOps {
        pub fn new() -> Self {
            Self {
                fail_alias: AtomicBool::new(false),
                aliases: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PrivilegedOps for MockOps {
        async fn arp_scan(&self, _subnet: &str) -> crate::error::Result<Vec<(String, String)>> {
            Ok(Vec::new())
        }
        async fn service_scan(
            &self,
            _targets: &[String],
            _ports: &[u16],
        ) -> crate::error::Result<Vec<ServiceScanResult>> {
            Ok(Vec::new())
        }
        async fn bind_listener(
            &self,
            address: &str,
            port: u16,
        ) -> crate::error::Result<std::net::TcpListener> {
            Ok(std::net::TcpListener::bind((address, port))?)
        }
        async fn start_dns_sniff(&self, _interface: &str) -> crate::error::Result<()> {
            Ok(())
        }
        async fn stop_dns_sniff(&self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn get_dns_queries(
            &self,
            _since: DateTime<Utc>,
        ) -> crate::error::Result<Vec<DnsQuery>> {
            Ok(Vec::new())
        }
        async fn add_ip_alias(
            &self,
            ip: &str,
            _interface: &str,
            _mask: &str,
        ) -> crate::error::Result<bool> {
            if self.fail_alias.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.aliases.lock().unwrap().push(ip.to_string());
            Ok(true)
        }
        async fn remove_ip_alias(&self, ip: &str, _interface: &str) -> crate::error::Result<bool> {
            self.aliases.lock().unwrap().retain(|a| a != ip);
            Ok(true)
        }
        async fn setup_port_forwards(
            &self,
            _rules: &[PortForwardRule],
            _interface: &str,
        ) -> crate::error::Result<bool> {
            Ok(true)
        }
        async fn clear_port_forwards(&self) -> crate::error::Result<bool> {
            Ok(true)
        }
    }

    fn allocator() -> IpAllocator {
        IpAllocator::new(
            "192.168.1.0/24",
            Some(Ipv4Addr::new(192, 168, 1, 1)),
            Some(Ipv4Addr::new(192, 168, 1, 201)),
            200,
            205,
        )
        .unwrap()
    }

    #[test]
    fn test_allocator_skips_gateway_and_sensor() {
        let alloc = allocator();
        // .201 is the sensor, so the pool is 200, 202..205.
        assert_eq!(alloc.available(), 5);
        let first = alloc.allocate().unwrap();
        assert_eq!(first, Ipv4Addr::new(192, 168, 1, 200));
        let second = alloc.allocate().unwrap();
        assert_eq!(second, Ipv4Addr::new(192, 168, 1, 202));
    }

    #[test]
    fn test_allocator_exhaustion_and_release() {
        let alloc = allocator();
        let mut ips = Vec::new();
        while let Some(ip) = alloc.allocate() {
            ips.push(ip);
        }
        assert_eq!(ips.len(), 5);
        assert!(alloc.allocate().is_none());

        alloc.release(ips[0]);
        assert_eq!(alloc.allocate(), Some(ips[0]));
    }

    #[tokio::test]
    async fn test_acquire_transitions_to_aliased() {
        let pool = db::init_test_db();
        let ops = Arc::new(MockOps::new());
        let manager = VirtualIpManager::new(ops.clone(), allocator(), pool.clone(), "eth0");

        let ip = manager.acquire().await.unwrap();
        let conn = pool.get().unwrap();
        assert_eq!(
            db_vips::get_state(&conn, &ip.to_string()).unwrap().as_deref(),
            Some("aliased")
        );
        assert_eq!(ops.aliases.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_acquire_rolls_back_on_alias_failure() {
        let pool = db::init_test_db();
        let ops = Arc::new(MockOps::new());
        ops.fail_alias.store(true, Ordering::SeqCst);
        let manager = VirtualIpManager::new(ops.clone(), allocator(), pool.clone(), "eth0");

        let before = manager.allocator.available();
        assert!(manager.acquire().await.is_err());
        // Reservation rolled back: allocated -> free.
        assert_eq!(manager.allocator.available(), before);
        let conn = pool.get().unwrap();
        assert!(db_vips::list_by_state(&conn, "allocated").unwrap().is_empty());
        assert!(db_vips::list_by_state(&conn, "aliased").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_returns_ip_to_pool() {
        let pool = db::init_test_db();
        let ops = Arc::new(MockOps::new());
        let manager = VirtualIpManager::new(ops.clone(), allocator(), pool.clone(), "eth0");

        let ip = manager.acquire().await.unwrap();
        let before = manager.allocator.available();
        manager.release(&ip.to_string()).await.unwrap();
        assert_eq!(manager.allocator.available(), before + 1);
        assert!(ops.aliases.lock().unwrap().is_empty());
    }
}
