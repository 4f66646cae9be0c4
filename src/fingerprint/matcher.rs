use std::collections::BTreeSet;

use crate::fingerprint::composite::CompositeFingerprint;

/// Auto-approve threshold: matches at or above this confidence silently
/// update the existing device.
pub const AUTO_APPROVE_THRESHOLD: f64 = 0.75;
/// Verification threshold: matches below this are treated as no match.
pub const VERIFY_THRESHOLD: f64 = 0.20;

const LEVENSHTEIN_STRONG: f64 = 0.85;
const JACCARD_STRONG: f64 = 0.7;
/// Confidence ceiling for a single strong signal.
const SINGLE_SIGNAL_CAP: f64 = 0.50;

/// A known device as seen by the matcher: latest fingerprint plus the raw
/// sets needed for Jaccard comparison.
#[derive(Debug, Clone)]
pub struct KnownDevice {
    pub device_id: i64,
    pub fingerprint: CompositeFingerprint,
    pub connection_destinations: BTreeSet<String>,
    pub open_ports: BTreeSet<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Score {
    strong: usize,
    weak_sum: f64,
}

/// Match a candidate fingerprint against all known devices.
///
/// Returns the best-matching device id and a confidence in [0, 1], or
/// `(None, 0.0)` when nothing clears the verification threshold.
///
/// Confidence tiers:
/// - one strong signal (MAC included) caps at 0.50 and requires human
///   verification;
/// - two or more strong signals, or MAC-exact plus any one other, reach
///   the auto-approve band (>= 0.75), growing with match count.
pub fn match_device(
    candidate: &CompositeFingerprint,
    known: &[KnownDevice],
    connection_destinations: &BTreeSet<String>,
    open_ports: &BTreeSet<u16>,
) -> (Option<i64>, f64) {
    if candidate.signal_count() == 0 || known.is_empty() {
        return (None, 0.0);
    }

    let mut best: Option<(i64, Score, f64)> = None;

    for device in known {
        let score = score_device(candidate, device, connection_destinations, open_ports);
        if score.strong == 0 {
            continue;
        }
        let confidence = confidence_for(score);

        let better = match &best {
            None => true,
            Some((_, best_score, best_conf)) => {
                confidence > *best_conf
                    || (confidence == *best_conf && score.strong > best_score.strong)
                    || (confidence == *best_conf
                        && score.strong == best_score.strong
                        && score.weak_sum > best_score.weak_sum)
            }
        };
        if better {
            best = Some((device.device_id, score, confidence));
        }
    }

    match best {
        Some((device_id, _, confidence)) if confidence >= VERIFY_THRESHOLD => {
            (Some(device_id), confidence)
        }
        _ => (None, 0.0),
    }
}

fn score_device(
    candidate: &CompositeFingerprint,
    device: &KnownDevice,
    connection_destinations: &BTreeSet<String>,
    open_ports: &BTreeSet<u16>,
) -> Score {
    let known_fp = &device.fingerprint;
    let mut strong = 0usize;
    let mut weak_sum = 0.0f64;

    if let (Some(a), Some(b)) = (&candidate.mac_address, &known_fp.mac_address) {
        if a.eq_ignore_ascii_case(b) {
            strong += 1;
        }
    }

    if let (Some(a), Some(b)) = (&candidate.mdns_hostname, &known_fp.mdns_hostname) {
        let sim = levenshtein_similarity(a, b);
        if sim >= LEVENSHTEIN_STRONG {
            strong += 1;
        } else {
            weak_sum += sim;
        }
    }

    if let (Some(a), Some(b)) = (
        &candidate.dhcp_fingerprint_hash,
        &known_fp.dhcp_fingerprint_hash,
    ) {
        if a == b {
            strong += 1;
        }
    }

    if let (Some(a), Some(b)) = (&candidate.open_ports_hash, &known_fp.open_ports_hash) {
        if a == b {
            strong += 1;
        } else {
            let sim = jaccard_u16(open_ports, &device.open_ports);
            if sim >= JACCARD_STRONG {
                strong += 1;
            } else {
                weak_sum += sim;
            }
        }
    }

    if let (Some(a), Some(b)) = (
        &candidate.connection_pattern_hash,
        &known_fp.connection_pattern_hash,
    ) {
        if a == b {
            strong += 1;
        } else {
            let sim = jaccard_str(connection_destinations, &device.connection_destinations);
            if sim >= JACCARD_STRONG {
                strong += 1;
            } else {
                weak_sum += sim;
            }
        }
    }

    Score { strong, weak_sum }
}

fn confidence_for(score: Score) -> f64 {
    match score.strong {
        0 => 0.0,
        1 => SINGLE_SIGNAL_CAP,
        // MAC-exact plus any one other signal lands here (n >= 2).
        n => (AUTO_APPROVE_THRESHOLD + 0.05 * (n as f64 - 2.0)).min(0.95),
    }
}

/// Normalized Levenshtein similarity in [0, 1].
pub fn levenshtein_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let distance = levenshtein(a, b);
    let max_len = a.chars().count().max(b.chars().count());
    1.0 - distance as f64 / max_len as f64
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            current[j + 1] = (prev[j + 1] + 1).min(current[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// Jaccard index of two port sets.
pub fn jaccard_u16(a: &BTreeSet<u16>, b: &BTreeSet<u16>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Jaccard index of two "ip:port" destination sets.
pub fn jaccard_str(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::composite::CompositeFingerprint;

    fn fp(
        mac: Option<&str>,
        mdns: Option<&str>,
        dhcp: Option<&str>,
        conn: Option<&str>,
        ports: Option<&str>,
    ) -> CompositeFingerprint {
        CompositeFingerprint::from_stored(
            mac.map(str::to_string),
            mdns.map(str::to_string),
            dhcp.map(str::to_string),
            conn.map(str::to_string),
            ports.map(str::to_string),
        )
    }

    fn known(device_id: i64, fingerprint: CompositeFingerprint) -> KnownDevice {
        KnownDevice {
            device_id,
            fingerprint,
            connection_destinations: BTreeSet::new(),
            open_ports: BTreeSet::new(),
        }
    }

    #[test]
    fn test_levenshtein_similarity() {
        assert_eq!(levenshtein_similarity("macbook", "macbook"), 1.0);
        assert_eq!(levenshtein_similarity("", ""), 1.0);
        assert_eq!(levenshtein_similarity("abc", ""), 0.0);
        let sim = levenshtein_similarity("macbook-pro", "macbook-pro-2");
        assert!(sim > 0.8 && sim < 1.0);
        assert!(levenshtein_similarity("kitchen-tv", "office-cam") < 0.5);
    }

    #[test]
    fn test_jaccard() {
        let a: BTreeSet<u16> = [80, 443, 22].into_iter().collect();
        let b: BTreeSet<u16> = [80, 443, 22].into_iter().collect();
        assert_eq!(jaccard_u16(&a, &b), 1.0);

        let c: BTreeSet<u16> = [8080].into_iter().collect();
        assert_eq!(jaccard_u16(&a, &c), 0.0);

        let d: BTreeSet<u16> = [80, 443].into_iter().collect();
        let sim = jaccard_u16(&a, &d);
        assert!((sim - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_exact_fingerprint_match_auto_approves() {
        let shared = fp(
            Some("AA:BB:CC:DD:EE:FF"),
            Some("macbook-pro"),
            Some("dhcp123"),
            Some("conn456"),
            Some("ports789"),
        );
        let devices = vec![known(1, shared.clone())];
        let (id, confidence) = match_device(&shared, &devices, &BTreeSet::new(), &BTreeSet::new());
        assert_eq!(id, Some(1));
        assert!(confidence >= AUTO_APPROVE_THRESHOLD);
    }

    #[test]
    fn test_two_non_mac_signals_survive_mac_change() {
        let candidate = fp(
            Some("11:22:33:44:55:66"),
            Some("macbook-pro"),
            Some("dhcp123"),
            None,
            None,
        );
        let stored = fp(
            Some("AA:BB:CC:DD:EE:FF"),
            Some("macbook-pro"),
            Some("dhcp123"),
            None,
            None,
        );
        let devices = vec![known(1, stored)];
        let (id, confidence) =
            match_device(&candidate, &devices, &BTreeSet::new(), &BTreeSet::new());
        assert_eq!(id, Some(1));
        assert!(confidence >= AUTO_APPROVE_THRESHOLD);
    }

    #[test]
    fn test_single_non_mac_signal_capped() {
        let candidate = fp(
            Some("11:22:33:44:55:66"),
            Some("macbook-pro"),
            Some("different"),
            None,
            None,
        );
        let stored = fp(
            Some("AA:BB:CC:DD:EE:FF"),
            Some("macbook-pro"),
            Some("dhcp123"),
            None,
            None,
        );
        let devices = vec![known(1, stored)];
        let (id, confidence) =
            match_device(&candidate, &devices, &BTreeSet::new(), &BTreeSet::new());
        assert_eq!(id, Some(1));
        assert!(confidence <= 0.50);
    }

    #[test]
    fn test_mac_only_capped() {
        let candidate = fp(Some("AA:BB:CC:DD:EE:FF"), None, None, None, None);
        let stored = fp(Some("AA:BB:CC:DD:EE:FF"), None, None, None, None);
        let devices = vec![known(1, stored)];
        let (id, confidence) =
            match_device(&candidate, &devices, &BTreeSet::new(), &BTreeSet::new());
        assert_eq!(id, Some(1));
        assert!(confidence <= 0.50);
    }

    #[test]
    fn test_mac_plus_one_signal_auto_approves() {
        let candidate = fp(Some("AA:BB:CC:DD:EE:FF"), Some("macbook-pro"), None, None, None);
        let stored = fp(Some("AA:BB:CC:DD:EE:FF"), Some("macbook-pro"), None, None, None);
        let devices = vec![known(1, stored)];
        let (id, confidence) =
            match_device(&candidate, &devices, &BTreeSet::new(), &BTreeSet::new());
        assert_eq!(id, Some(1));
        assert!(confidence >= AUTO_APPROVE_THRESHOLD);
    }

    #[test]
    fn test_no_shared_signals_returns_none() {
        let candidate = fp(
            Some("11:22:33:44:55:66"),
            Some("totally-different"),
            Some("dhcp-x"),
            None,
            None,
        );
        let stored = fp(
            Some("AA:BB:CC:DD:EE:FF"),
            Some("macbook-pro"),
            Some("dhcp123"),
            None,
            None,
        );
        let devices = vec![known(1, stored)];
        let (id, confidence) =
            match_device(&candidate, &devices, &BTreeSet::new(), &BTreeSet::new());
        assert_eq!(id, None);
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn test_empty_candidate_returns_none() {
        let candidate = fp(None, None, None, None, None);
        let stored = fp(Some("AA:BB:CC:DD:EE:FF"), None, None, None, None);
        let (id, confidence) = match_device(
            &candidate,
            &[known(1, stored)],
            &BTreeSet::new(),
            &BTreeSet::new(),
        );
        assert_eq!(id, None);
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn test_empty_known_list_returns_none() {
        let candidate = fp(Some("AA:BB:CC:DD:EE:FF"), Some("macbook-pro"), None, None, None);
        let (id, confidence) = match_device(&candidate, &[], &BTreeSet::new(), &BTreeSet::new());
        assert_eq!(id, None);
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn test_tie_broken_by_match_count() {
        let candidate = fp(
            Some("11:22:33:44:55:66"),
            Some("macbook-pro"),
            Some("dhcp123"),
            None,
            Some("ports789"),
        );
        let strong_device = fp(
            Some("AA:BB:CC:DD:EE:01"),
            Some("macbook-pro"),
            Some("dhcp123"),
            None,
            Some("ports789"),
        );
        let weak_device = fp(
            Some("AA:BB:CC:DD:EE:02"),
            Some("macbook-pro"),
            Some("other-dhcp"),
            None,
            Some("other-ports"),
        );
        let mut weak = known(2, weak_device);
        weak.open_ports = [8080].into_iter().collect();
        let mut strong = known(1, strong_device);
        strong.open_ports = [22, 80, 443].into_iter().collect();

        let scanned_ports: BTreeSet<u16> = [22, 80, 443].into_iter().collect();
        let (id, _) = match_device(
            &candidate,
            &[weak, strong],
            &BTreeSet::new(),
            &scanned_ports,
        );
        assert_eq!(id, Some(1));
    }

    #[test]
    fn test_jaccard_ports_count_as_strong() {
        // Port hash differs (one extra port) but Jaccard overlap >= 0.7.
        let candidate = fp(
            Some("11:22:33:44:55:66"),
            Some("macbook-pro"),
            None,
            None,
            Some("hash-a"),
        );
        let stored = fp(
            Some("AA:BB:CC:DD:EE:FF"),
            Some("macbook-pro"),
            None,
            None,
            Some("hash-b"),
        );
        let mut device = known(1, stored);
        device.open_ports = [22, 80, 443, 8080].into_iter().collect();
        let scanned: BTreeSet<u16> = [22, 80, 443].into_iter().collect();

        let (id, confidence) = match_device(&candidate, &[device], &BTreeSet::new(), &scanned);
        assert_eq!(id, Some(1));
        // mDNS strong + Jaccard-strong ports = 2 strong signals
        assert!(confidence >= AUTO_APPROVE_THRESHOLD);
    }

    #[test]
    fn test_confidence_monotonic_in_match_count() {
        let two = confidence_for(Score { strong: 2, weak_sum: 0.0 });
        let three = confidence_for(Score { strong: 3, weak_sum: 0.0 });
        let five = confidence_for(Score { strong: 5, weak_sum: 0.0 });
        assert!(two < three && three < five);
        assert!(five <= 0.95);
    }
}
