//! Event type strings. These are wire contract: clients and subscribers
//! match on them exactly.

pub const DEVICE_NEW: &str = "device.new";
pub const DEVICE_UPDATED: &str = "device.updated";
pub const DEVICE_VERIFICATION_NEEDED: &str = "device.verification_needed";
pub const DEVICE_MAC_CHANGED: &str = "device.mac_changed";

pub const DECOY_STATUS_CHANGED: &str = "decoy.status_changed";
pub const DECOY_HEALTH_CHANGED: &str = "decoy.health_changed";
pub const DECOY_TRIP: &str = "decoy.trip";
pub const DECOY_CREDENTIAL_TRIP: &str = "decoy.credential_trip";

pub const ALERT_NEW: &str = "alert.new";
pub const INCIDENT_NEW: &str = "incident.new";
pub const INCIDENT_UPDATED: &str = "incident.updated";

pub const SYSTEM_SCAN_COMPLETE: &str = "system.scan_complete";

/// Wildcard subscription token.
pub const ALL: &str = "*";
