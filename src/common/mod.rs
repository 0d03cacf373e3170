pub mod config;
pub mod curve;
pub mod error;
pub mod logging;
pub mod protocol;

pub use config::{ClientSettings, ServerSettings};
pub use curve::{CurveEngine, FanCurve, Hysteresis};
pub use error::{FanError, Result};
pub use protocol::{TelemetryFrame, TemperatureSample};
