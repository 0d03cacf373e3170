pub mod link;
pub mod monitor;
pub mod nvgpu;
pub mod sensor;

pub use link::{Backoff, Delivery, LinkState, TelemetryLink};
pub use monitor::TemperatureMonitor;
pub use sensor::SensorReader;
