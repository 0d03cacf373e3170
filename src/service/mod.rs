pub mod actuator;
pub mod controller;
pub mod daemon;
pub mod session;
pub mod state;

pub use actuator::{HwmonActuator, PwmControl};
pub use controller::Controller;
pub use daemon::Daemon;
pub use session::SessionManager;
pub use state::{FanTable, Freshness, GpuState};
