pub mod linux;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Result of a service/port scan on a single port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceScanResult {
    pub ip: String,
    pub port: u16,
    pub banner: Option<String>,
}

/// A captured DNS query.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub query_name: String,
    pub source_ip: String,
    pub timestamp: DateTime<Utc>,
}

/// A single port-forward (DNAT) rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardRule {
    pub from_ip: String,
    pub from_port: u16,
    pub to_ip: String,
    pub to_port: u16,
}

/// Abstract interface for operations requiring elevated privileges:
/// ARP scanning, raw service scans, privileged listeners, DNS sniffing,
/// IP alias management, and port-forward rules.
///
/// The Linux implementation performs these directly (the sensor runs with
/// CAP_NET_RAW/CAP_NET_ADMIN); other platforms can delegate to a helper
/// process behind the same trait.
#[async_trait]
pub trait PrivilegedOps: Send + Sync {
    /// Scan a subnet and return (ip, mac) pairs for responding hosts.
    async fn arp_scan(&self, subnet: &str) -> Result<Vec<(String, String)>>;

    /// Scan targets for open services on the given ports.
    async fn service_scan(
        &self,
        targets: &[String],
        ports: &[u16],
    ) -> Result<Vec<ServiceScanResult>>;

    /// Bind a listening socket (ports < 1024 require privilege).
    async fn bind_listener(&self, address: &str, port: u16) -> Result<std::net::TcpListener>;

    /// Start passive DNS query capture on an interface.
    async fn start_dns_sniff(&self, interface: &str) -> Result<()>;

    /// Stop passive DNS query capture.
    async fn stop_dns_sniff(&self) -> Result<()>;

    /// DNS queries observed since the given timestamp.
    async fn get_dns_queries(&self, since: DateTime<Utc>) -> Result<Vec<DnsQuery>>;

    /// Add an IP alias to an interface. True on success.
    async fn add_ip_alias(&self, ip: &str, interface: &str, mask: &str) -> Result<bool>;

    /// Remove an IP alias from an interface. True on success.
    async fn remove_ip_alias(&self, ip: &str, interface: &str) -> Result<bool>;

    /// Install the full set of port-forward rules (replaces prior rules).
    async fn setup_port_forwards(&self, rules: &[PortForwardRule], interface: &str)
        -> Result<bool>;

    /// Clear all port-forward rules owned by the sensor.
    async fn clear_port_forwards(&self) -> Result<bool>;
}
