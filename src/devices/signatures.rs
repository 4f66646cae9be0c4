use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Result, SensorError};
use crate::fingerprint::composite::CompositeFingerprint;

/// Packaged signature artifact, loaded once at startup.
const BUNDLED_SIGNATURES: &str = include_str!("../../resources/device_signatures.json");

/// Result of classifying a fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceClassification {
    pub manufacturer: String,
    pub device_type: String,
    pub model: Option<String>,
    pub confidence: f64,
    pub source: ClassificationSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationSource {
    Local,
    Llm,
    Unknown,
}

impl ClassificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationSource::Local => "local",
            ClassificationSource::Llm => "llm",
            ClassificationSource::Unknown => "unknown",
        }
    }
}

impl DeviceClassification {
    pub fn unknown() -> Self {
        Self {
            manufacturer: "Unknown".to_string(),
            device_type: "unknown".to_string(),
            model: None,
            confidence: 0.0,
            source: ClassificationSource::Unknown,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SignatureArtifact {
    #[serde(default)]
    oui_prefixes: HashMap<String, String>,
    #[serde(default)]
    name_patterns: Vec<NamePattern>,
    #[serde(default)]
    dhcp_fingerprints: HashMap<String, DhcpSignature>,
    #[serde(default)]
    manufacturer_types: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct NamePattern {
    pattern: String,
    device_type: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DhcpSignature {
    manufacturer: String,
    device_type: String,
}

/// Immutable in-process signature database: OUI prefix -> manufacturer,
/// hostname pattern -> device type, DHCP option hash -> classification.
pub struct SignatureDb {
    oui_prefixes: HashMap<[u8; 3], String>,
    name_patterns: Vec<(Regex, String)>,
    dhcp_fingerprints: HashMap<String, DhcpSignature>,
    manufacturer_types: HashMap<String, String>,
}

impl SignatureDb {
    /// Load the bundled signature artifact.
    pub fn bundled() -> Self {
        Self::from_json(BUNDLED_SIGNATURES).expect("bundled signature artifact is valid")
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let artifact: SignatureArtifact =
            serde_json::from_str(raw).map_err(|e| SensorError::Config(e.to_string()))?;

        let mut oui_prefixes = HashMap::new();
        for (prefix, manufacturer) in artifact.oui_prefixes {
            if let Some(bytes) = parse_mac_prefix(&prefix) {
                oui_prefixes.insert(bytes, manufacturer);
            } else {
                log::debug!("Skipping malformed OUI prefix '{prefix}'");
            }
        }

        let mut name_patterns = Vec::new();
        for entry in artifact.name_patterns {
            match Regex::new(&entry.pattern) {
                Ok(re) => name_patterns.push((re, entry.device_type)),
                Err(e) => log::warn!("Skipping invalid name pattern '{}': {e}", entry.pattern),
            }
        }

        Ok(Self {
            oui_prefixes,
            name_patterns,
            dhcp_fingerprints: artifact.dhcp_fingerprints,
            manufacturer_types: artifact.manufacturer_types,
        })
    }

    pub fn empty() -> Self {
        Self {
            oui_prefixes: HashMap::new(),
            name_patterns: Vec::new(),
            dhcp_fingerprints: HashMap::new(),
            manufacturer_types: HashMap::new(),
        }
    }

    /// Extend the OUI map from an IEEE-format CSV file
    /// ("Registry","Assignment","Organization Name",...).
    pub fn extend_from_oui_csv(&mut self, path: &Path) -> Result<usize> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|e| SensorError::Config(e.to_string()))?;

        let mut loaded = 0usize;
        for result in reader.records() {
            let record = match result {
                Ok(r) => r,
                Err(e) => {
                    log::debug!("Skipping malformed OUI record: {e}");
                    continue;
                }
            };
            if record.len() < 3 {
                continue;
            }
            let assignment = record[1].trim();
            let org_name = record[2].trim();
            if let Some(prefix) = parse_oui_hex(assignment) {
                self.oui_prefixes
                    .entry(prefix)
                    .or_insert_with(|| org_name.to_string());
                loaded += 1;
            }
        }
        log::info!("Loaded {loaded} OUI entries from {}", path.display());
        Ok(loaded)
    }

    pub fn oui_count(&self) -> usize {
        self.oui_prefixes.len()
    }

    /// Classify a fingerprint from local signatures only.
    pub fn classify(&self, fp: &CompositeFingerprint) -> DeviceClassification {
        let dhcp_match = fp
            .dhcp_fingerprint_hash
            .as_deref()
            .and_then(|hash| self.dhcp_fingerprints.get(hash));

        let manufacturer = fp
            .mac_address
            .as_deref()
            .and_then(|mac| self.lookup_vendor(mac))
            .map(str::to_string)
            .or_else(|| dhcp_match.map(|sig| sig.manufacturer.clone()));

        let name_type = fp.mdns_hostname.as_deref().and_then(|hostname| {
            self.name_patterns
                .iter()
                .find(|(re, _)| re.is_match(hostname))
                .map(|(_, device_type)| device_type.clone())
        });

        let device_type = name_type
            .clone()
            .or_else(|| dhcp_match.map(|sig| sig.device_type.clone()))
            .or_else(|| {
                manufacturer
                    .as_deref()
                    .and_then(|m| self.manufacturer_types.get(m).cloned())
            });

        let has_manufacturer = manufacturer.is_some();
        let has_type = device_type.is_some();
        let confidence = match (has_manufacturer, name_type.is_some()) {
            (true, true) => 0.9,
            (true, false) => 0.7,
            (false, true) => 0.6,
            (false, false) => 0.0,
        };

        if !has_manufacturer && !has_type {
            return DeviceClassification::unknown();
        }

        DeviceClassification {
            manufacturer: manufacturer.unwrap_or_else(|| "Unknown".to_string()),
            device_type: device_type.unwrap_or_else(|| "unknown".to_string()),
            model: None,
            confidence,
            source: ClassificationSource::Local,
        }
    }

    /// Look up the vendor for a MAC address.
    /// Accepts "AA:BB:CC:DD:EE:FF", "AA-BB-CC-DD-EE-FF", "AABB.CCDD.EEFF".
    pub fn lookup_vendor(&self, mac: &str) -> Option<&str> {
        let prefix = parse_mac_prefix(mac)?;
        self.oui_prefixes.get(&prefix).map(|s| s.as_str())
    }
}

/// Extract the OUI prefix (first 3 bytes) from a MAC address string.
fn parse_mac_prefix(mac: &str) -> Option<[u8; 3]> {
    let cleaned: String = mac.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if cleaned.len() < 6 {
        return None;
    }
    parse_oui_hex(&cleaned[..6])
}

/// Parse a 6-char hex string (e.g., "AABBCC") into 3 bytes.
fn parse_oui_hex(raw: &str) -> Option<[u8; 3]> {
    let raw = raw.trim();
    if raw.len() != 6 {
        return None;
    }
    let bytes = hex::decode(raw).ok()?;
    Some([bytes[0], bytes[1], bytes[2]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::composite::compute_fingerprint;

    #[test]
    fn test_bundled_artifact_loads() {
        let db = SignatureDb::bundled();
        assert!(db.oui_count() > 50);
    }

    #[test]
    fn test_lookup_vendor_formats() {
        let db = SignatureDb::bundled();
        assert_eq!(db.lookup_vendor("A4:83:E7:11:22:33"), Some("Apple"));
        assert_eq!(db.lookup_vendor("a4-83-e7-11-22-33"), Some("Apple"));
        assert_eq!(db.lookup_vendor("A483.E711.2233"), Some("Apple"));
        assert!(db.lookup_vendor("00:00:00:00:00:00").is_none());
        assert!(db.lookup_vendor("junk").is_none());
    }

    #[test]
    fn test_classify_by_oui_with_manufacturer_default() {
        let db = SignatureDb::bundled();
        let fp = compute_fingerprint(Some("A4:83:E7:11:22:33"), None, None, None, None);
        let result = db.classify(&fp);
        assert_eq!(result.manufacturer, "Apple");
        assert_eq!(result.device_type, "computer");
        assert_eq!(result.source, ClassificationSource::Local);
        assert!(result.confidence >= 0.7);
    }

    #[test]
    fn test_classify_by_hostname_pattern() {
        let db = SignatureDb::bundled();
        let fp = compute_fingerprint(
            Some("A4:83:E7:11:22:33"),
            Some("sarahs-iphone.local"),
            None,
            None,
            None,
        );
        let result = db.classify(&fp);
        assert_eq!(result.manufacturer, "Apple");
        assert_eq!(result.device_type, "phone");
        assert!(result.confidence >= 0.9);
    }

    #[test]
    fn test_classify_unknown() {
        let db = SignatureDb::bundled();
        let fp = compute_fingerprint(Some("02:00:00:AA:BB:CC"), None, None, None, None);
        let result = db.classify(&fp);
        assert_eq!(result.manufacturer, "Unknown");
        assert_eq!(result.device_type, "unknown");
        assert_eq!(result.source, ClassificationSource::Unknown);
    }

    #[test]
    fn test_empty_db() {
        let db = SignatureDb::empty();
        let fp = compute_fingerprint(Some("A4:83:E7:11:22:33"), None, None, None, None);
        assert_eq!(db.classify(&fp).manufacturer, "Unknown");
    }

    #[test]
    fn test_pattern_only_classification() {
        let db = SignatureDb::bundled();
        let fp = compute_fingerprint(None, Some("hallway-camera.local"), None, None, None);
        let result = db.classify(&fp);
        assert_eq!(result.manufacturer, "Unknown");
        assert_eq!(result.device_type, "camera");
        assert_eq!(result.source, ClassificationSource::Local);
    }
}
