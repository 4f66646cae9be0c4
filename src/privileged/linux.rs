use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::{Result, SensorError};
use crate::privileged::{DnsQuery, PortForwardRule, PrivilegedOps, ServiceScanResult};
use crate::scanner::port::PortScanner;

/// Dedicated NAT chain owned by the sensor. Teardown flushes this chain
/// only, never the system tables.
const NAT_CHAIN: &str = "SQUIRRELOPS_MIMIC";

/// Cap on buffered DNS queries between monitor polls.
const DNS_BUFFER_LIMIT: usize = 4096;

/// Direct privileged operations for Linux. The sensor runs with
/// CAP_NET_RAW and CAP_NET_ADMIN, so everything is done with local
/// subprocesses: `ip neigh` / `arp` for neighbor discovery, `ip addr`
/// for aliases, `iptables` for DNAT, and a line-buffered `tcpdump` pipe
/// feeding the DNS query buffer.
pub struct LinuxPrivilegedOps {
    dns_queries: Arc<Mutex<Vec<DnsQuery>>>,
    sniff_task: Mutex<Option<JoinHandle<()>>>,
    port_scanner: PortScanner,
}

impl Default for LinuxPrivilegedOps {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxPrivilegedOps {
    pub fn new() -> Self {
        Self {
            dns_queries: Arc::new(Mutex::new(Vec::new())),
            sniff_task: Mutex::new(None),
            port_scanner: PortScanner::default(),
        }
    }

    async fn run_iptables(args: &[&str]) -> bool {
        match Command::new("iptables")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
        {
            Ok(output) => {
                if !output.status.success() {
                    log::debug!(
                        "iptables {:?} failed: {}",
                        args,
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                output.status.success()
            }
            Err(e) => {
                log::debug!("iptables {args:?} exec error: {e}");
                false
            }
        }
    }

    fn validate_ipv4(ip: &str) -> Result<Ipv4Addr> {
        ip.parse::<Ipv4Addr>()
            .map_err(|_| SensorError::Privileged(format!("invalid IPv4 address: {ip}")))
    }

    fn mask_to_prefix(mask: &str) -> Result<u32> {
        let addr = Self::validate_ipv4(mask)?;
        Ok(u32::from(addr).count_ones())
    }
}

#[async_trait]
impl PrivilegedOps for LinuxPrivilegedOps {
    async fn arp_scan(&self, subnet: &str) -> Result<Vec<(String, String)>> {
        // Nudge the neighbor table by touching every host, then read it
        // back. A ping sweep is slower than raw ARP but needs no packet
        // crafting; unanswered hosts simply stay absent.
        ping_sweep(subnet).await;

        let output = Command::new("ip")
            .args(["neigh", "show"])
            .output()
            .await
            .map_err(|e| SensorError::Privileged(format!("ip neigh: {e}")))?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_ip_neigh(&text, subnet))
    }

    async fn service_scan(
        &self,
        targets: &[String],
        ports: &[u16],
    ) -> Result<Vec<ServiceScanResult>> {
        let scanned = self.port_scanner.scan_with_banners(targets, ports).await;
        let mut results = Vec::new();
        for (ip, port_results) in scanned {
            for r in port_results {
                results.push(ServiceScanResult {
                    ip: ip.clone(),
                    port: r.port,
                    banner: r.banner,
                });
            }
        }
        Ok(results)
    }

    async fn bind_listener(&self, address: &str, port: u16) -> Result<std::net::TcpListener> {
        let listener = std::net::TcpListener::bind((address, port))?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    async fn start_dns_sniff(&self, interface: &str) -> Result<()> {
        let mut guard = self.sniff_task.lock().unwrap();
        if guard.is_some() {
            return Ok(());
        }

        let mut child = Command::new("tcpdump")
            .args(["-l", "-n", "-i", interface, "udp", "and", "dst", "port", "53"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SensorError::Privileged(format!("tcpdump spawn: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SensorError::Privileged("tcpdump produced no stdout".to_string()))?;

        let buffer = self.dns_queries.clone();
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(query) = parse_tcpdump_dns_line(&line) {
                    let mut queries = buffer.lock().unwrap();
                    queries.push(query);
                    if queries.len() > DNS_BUFFER_LIMIT {
                        let excess = queries.len() - DNS_BUFFER_LIMIT;
                        queries.drain(..excess);
                    }
                }
            }
            let _ = child.wait().await;
        });

        *guard = Some(handle);
        log::info!("DNS sniff started on {interface}");
        Ok(())
    }

    async fn stop_dns_sniff(&self) -> Result<()> {
        if let Some(handle) = self.sniff_task.lock().unwrap().take() {
            handle.abort();
        }
        Ok(())
    }

    async fn get_dns_queries(&self, since: DateTime<Utc>) -> Result<Vec<DnsQuery>> {
        let queries = self.dns_queries.lock().unwrap();
        Ok(queries
            .iter()
            .filter(|q| q.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn add_ip_alias(&self, ip: &str, interface: &str, mask: &str) -> Result<bool> {
        Self::validate_ipv4(ip)?;
        let prefix = Self::mask_to_prefix(mask)?;
        let output = Command::new("ip")
            .args(["addr", "add", &format!("{ip}/{prefix}"), "dev", interface])
            .output()
            .await
            .map_err(|e| SensorError::Privileged(format!("ip addr add: {e}")))?;
        if !output.status.success() {
            log::warn!(
                "ip addr add failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn remove_ip_alias(&self, ip: &str, interface: &str) -> Result<bool> {
        Self::validate_ipv4(ip)?;
        let output = Command::new("ip")
            .args(["addr", "del", &format!("{ip}/32"), "dev", interface])
            .output()
            .await
            .map_err(|e| SensorError::Privileged(format!("ip addr del: {e}")))?;
        if !output.status.success() {
            log::warn!(
                "ip addr del failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn setup_port_forwards(
        &self,
        rules: &[PortForwardRule],
        _interface: &str,
    ) -> Result<bool> {
        // Flush our chain, recreate it, make sure PREROUTING references it.
        Self::run_iptables(&["-t", "nat", "-F", NAT_CHAIN]).await;
        Self::run_iptables(&["-t", "nat", "-N", NAT_CHAIN]).await;
        if !Self::run_iptables(&["-t", "nat", "-C", "PREROUTING", "-j", NAT_CHAIN]).await {
            Self::run_iptables(&["-t", "nat", "-A", "PREROUTING", "-j", NAT_CHAIN]).await;
        }

        for rule in rules {
            Self::validate_ipv4(&rule.from_ip)?;
            Self::validate_ipv4(&rule.to_ip)?;
            let from_port = rule.from_port.to_string();
            let dest = format!("{}:{}", rule.to_ip, rule.to_port);
            let ok = Self::run_iptables(&[
                "-t", "nat", "-A", NAT_CHAIN, "-p", "tcp", "-d", &rule.from_ip, "--dport",
                &from_port, "-j", "DNAT", "--to-destination", &dest,
            ])
            .await;
            if !ok {
                log::warn!(
                    "Failed to add DNAT rule {}:{} -> {}:{}",
                    rule.from_ip,
                    rule.from_port,
                    rule.to_ip,
                    rule.to_port
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn clear_port_forwards(&self) -> Result<bool> {
        Ok(Self::run_iptables(&["-t", "nat", "-F", NAT_CHAIN]).await)
    }
}

/// Touch every host in the subnet so the kernel resolves neighbors.
async fn ping_sweep(subnet: &str) {
    let Some(hosts) = subnet_hosts(subnet) else {
        return;
    };
    let semaphore = Arc::new(tokio::sync::Semaphore::new(64));
    let mut handles = Vec::new();
    for host in hosts {
        let sem = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire().await.ok()?;
            let _ = tokio::time::timeout(
                std::time::Duration::from_millis(300),
                tokio::net::TcpStream::connect((host, 80)),
            )
            .await;
            Some(())
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

/// Host addresses of a /24-or-smaller IPv4 CIDR. Larger networks are
/// truncated to the first 1024 hosts to bound the sweep.
fn subnet_hosts(subnet: &str) -> Option<Vec<Ipv4Addr>> {
    let (base, prefix) = subnet.split_once('/')?;
    let base: Ipv4Addr = base.parse().ok()?;
    let prefix: u32 = prefix.parse().ok()?;
    if prefix > 30 {
        return None;
    }
    let mask = u32::MAX << (32 - prefix);
    let network = u32::from(base) & mask;
    let size = (1u32 << (32 - prefix)).min(1026);
    Some(
        (1..size - 1)
            .map(|offset| Ipv4Addr::from(network + offset))
            .collect(),
    )
}

/// Parse `ip neigh show` output into (ip, mac) pairs within the subnet.
///
/// Format: `192.168.1.7 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE`
/// FAILED/INCOMPLETE entries have no lladdr and are skipped.
fn parse_ip_neigh(output: &str, subnet: &str) -> Vec<(String, String)> {
    let re = Regex::new(r"^(\d+\.\d+\.\d+\.\d+)\s+dev\s+\S+\s+lladdr\s+([0-9a-fA-F:]{17})")
        .expect("static regex");

    let network = subnet.split_once('/').and_then(|(base, prefix)| {
        let base: Ipv4Addr = base.parse().ok()?;
        let prefix: u32 = prefix.parse().ok()?;
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        Some((u32::from(base) & mask, mask))
    });

    let mut results = Vec::new();
    for line in output.lines() {
        if let Some(caps) = re.captures(line.trim()) {
            let ip = caps[1].to_string();
            let mac = caps[2].to_lowercase();
            if mac == "ff:ff:ff:ff:ff:ff" {
                continue;
            }
            if let Some((network, mask)) = network {
                if let Ok(addr) = ip.parse::<Ipv4Addr>() {
                    if u32::from(addr) & mask != network {
                        continue;
                    }
                }
            }
            results.push((ip, mac));
        }
    }
    results
}

/// Parse one tcpdump line into a DNS query record.
///
/// Example: `12:00:01.123456 IP 192.168.1.99.52311 > 192.168.1.1.53: 12345+ A? abc.canary.example.io. (41)`
fn parse_tcpdump_dns_line(line: &str) -> Option<DnsQuery> {
    let re = Regex::new(
        r"IP\s+(\d+\.\d+\.\d+\.\d+)\.\d+\s+>\s+\S+:\s+\d+\+?\s+(?:A|AAAA|CNAME|ANY)\??\s+(\S+?)\.?\s",
    )
    .ok()?;
    let caps = re.captures(line)?;
    Some(DnsQuery {
        query_name: caps[2].trim_end_matches('.').to_string(),
        source_ip: caps[1].to_string(),
        timestamp: Utc::now(),
    })
}
