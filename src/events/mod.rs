pub mod bus;
pub mod log;
pub mod types;

pub use bus::EventBus;
pub use log::{Event, EventLog};
