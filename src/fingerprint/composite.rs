use sha2::{Digest, Sha256};

/// Multi-signal device fingerprint.
///
/// Up to five signals; each hash field is a stable hash of the normalized
/// input so fingerprints can be compared across restarts. The composite
/// hash covers the ordered signal tuple and serves as a weak identity key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompositeFingerprint {
    pub mac_address: Option<String>,
    /// Normalized: lowercased, trailing dot and ".local" suffix stripped.
    pub mdns_hostname: Option<String>,
    pub dhcp_fingerprint_hash: Option<String>,
    pub connection_pattern_hash: Option<String>,
    pub open_ports_hash: Option<String>,
    pub composite_hash: String,
}

impl CompositeFingerprint {
    /// Number of non-null signals.
    pub fn signal_count(&self) -> usize {
        [
            self.mac_address.is_some(),
            self.mdns_hostname.is_some(),
            self.dhcp_fingerprint_hash.is_some(),
            self.connection_pattern_hash.is_some(),
            self.open_ports_hash.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }

    /// Rebuild a fingerprint from persisted hash columns (startup load).
    pub fn from_stored(
        mac_address: Option<String>,
        mdns_hostname: Option<String>,
        dhcp_fingerprint_hash: Option<String>,
        connection_pattern_hash: Option<String>,
        open_ports_hash: Option<String>,
    ) -> Self {
        let mut fp = Self {
            mac_address,
            mdns_hostname,
            dhcp_fingerprint_hash,
            connection_pattern_hash,
            open_ports_hash,
            composite_hash: String::new(),
        };
        fp.composite_hash = composite_hash_of(&fp);
        fp
    }
}

/// Compose a fingerprint from raw scan signals.
pub fn compute_fingerprint(
    mac: Option<&str>,
    mdns_hostname: Option<&str>,
    dhcp_options: Option<&[u8]>,
    connections: Option<&[(String, u16)]>,
    open_ports: Option<&[u16]>,
) -> CompositeFingerprint {
    let mdns = mdns_hostname.map(normalize_mdns_hostname);

    let dhcp_hash = dhcp_options.map(|options| {
        let joined = options
            .iter()
            .map(|o| o.to_string())
            .collect::<Vec<_>>()
            .join(",");
        stable_hash(&joined)
    });

    let connection_hash = connections.map(|conns| {
        let mut dests: Vec<String> = conns
            .iter()
            .map(|(ip, port)| format!("{ip}:{port}"))
            .collect();
        dests.sort();
        dests.dedup();
        stable_hash(&dests.join(","))
    });

    let ports_hash = open_ports.map(|ports| {
        let mut sorted: Vec<u16> = ports.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let joined = sorted
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        stable_hash(&joined)
    });

    let mut fp = CompositeFingerprint {
        mac_address: mac.map(|m| m.trim().to_string()),
        mdns_hostname: mdns,
        dhcp_fingerprint_hash: dhcp_hash,
        connection_pattern_hash: connection_hash,
        open_ports_hash: ports_hash,
        composite_hash: String::new(),
    };
    fp.composite_hash = composite_hash_of(&fp);
    fp
}

/// Lowercase, strip one trailing dot, strip a ".local" suffix.
pub fn normalize_mdns_hostname(hostname: &str) -> String {
    let mut name = hostname.trim().to_lowercase();
    if name.ends_with('.') {
        name.pop();
    }
    if let Some(stripped) = name.strip_suffix(".local") {
        name = stripped.to_string();
    }
    name
}

fn composite_hash_of(fp: &CompositeFingerprint) -> String {
    let tuple = [
        fp.mac_address.as_deref().unwrap_or(""),
        fp.mdns_hostname.as_deref().unwrap_or(""),
        fp.dhcp_fingerprint_hash.as_deref().unwrap_or(""),
        fp.connection_pattern_hash.as_deref().unwrap_or(""),
        fp.open_ports_hash.as_deref().unwrap_or(""),
    ]
    .join("|");
    stable_hash(&tuple)
}

/// Truncated SHA-256 hex digest, stable across runs.
fn stable_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mdns_hostname() {
        assert_eq!(normalize_mdns_hostname("MacBook-Pro.local."), "macbook-pro");
        assert_eq!(normalize_mdns_hostname("printer.local"), "printer");
        assert_eq!(normalize_mdns_hostname("bare-name"), "bare-name");
    }

    #[test]
    fn test_port_order_does_not_change_hash() {
        let a = compute_fingerprint(None, None, None, None, Some(&[443, 22, 80]));
        let b = compute_fingerprint(None, None, None, None, Some(&[22, 80, 443]));
        assert_eq!(a.open_ports_hash, b.open_ports_hash);
        assert_eq!(a.composite_hash, b.composite_hash);
    }

    #[test]
    fn test_connection_order_does_not_change_hash() {
        let conns_a = vec![("8.8.8.8".to_string(), 443), ("1.1.1.1".to_string(), 53)];
        let conns_b = vec![("1.1.1.1".to_string(), 53), ("8.8.8.8".to_string(), 443)];
        let a = compute_fingerprint(None, None, None, Some(&conns_a), None);
        let b = compute_fingerprint(None, None, None, Some(&conns_b), None);
        assert_eq!(a.connection_pattern_hash, b.connection_pattern_hash);
    }

    #[test]
    fn test_dhcp_order_matters() {
        // DHCP option order is itself a signal; the raw tuple is hashed.
        let a = compute_fingerprint(None, None, Some(&[1, 3, 6]), None, None);
        let b = compute_fingerprint(None, None, Some(&[6, 3, 1]), None, None);
        assert_ne!(a.dhcp_fingerprint_hash, b.dhcp_fingerprint_hash);
    }

    #[test]
    fn test_signal_count() {
        let fp = compute_fingerprint(
            Some("AA:BB:CC:DD:EE:FF"),
            Some("macbook-pro"),
            None,
            None,
            Some(&[22]),
        );
        assert_eq!(fp.signal_count(), 3);

        let empty = compute_fingerprint(None, None, None, None, None);
        assert_eq!(empty.signal_count(), 0);
    }

    #[test]
    fn test_stable_across_calls() {
        let a = compute_fingerprint(Some("AA:BB:CC:DD:EE:FF"), Some("tv.local"), None, None, None);
        let b = compute_fingerprint(Some("AA:BB:CC:DD:EE:FF"), Some("tv.local"), None, None, None);
        assert_eq!(a.composite_hash, b.composite_hash);
    }
}
