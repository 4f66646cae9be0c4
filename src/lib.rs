pub mod alerts;
pub mod config;
pub mod db;
pub mod decoys;
pub mod devices;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod integrations;
pub mod network;
pub mod privileged;
pub mod scanner;
pub mod scouts;
pub mod timefmt;

pub use config::Config;
pub use error::{Result, SensorError};
