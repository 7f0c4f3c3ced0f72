pub mod config;
pub mod log_buffer;
pub mod logging;
pub mod resource_monitor;

pub use config::{Config, ConfigHandle, GlobalConfig};
pub use log_buffer::{EventSink, FanOut, JobEvent, LogBuffer};
pub use resource_monitor::{LoadProbe, NetworkMonitor, NetworkProbe};
