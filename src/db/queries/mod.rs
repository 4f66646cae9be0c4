pub mod alerts;
pub mod credentials;
pub mod decoys;
pub mod devices;
pub mod fingerprints;
pub mod profiles;
pub mod retention;
pub mod virtual_ips;
