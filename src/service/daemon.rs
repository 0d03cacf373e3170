use crate::common::config::ServerSettings;
use crate::common::error::Result;
use crate::service::actuator::{HwmonActuator, PwmControl};
use crate::service::controller::Controller;
use crate::service::session::SessionManager;
use crate::service::state::FanTable;
use log::{info, warn};
use nix::unistd::geteuid;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use tokio::time::Instant;

/// hwmon control files are normally root-only; say so early instead of
/// failing on the first write.
pub fn warn_if_unprivileged() {
    if !geteuid().is_root() {
        warn!("Not running as root, writing to hwmon PWM files will probably fail");
    }
}

pub fn open_actuators(settings: &ServerSettings) -> Result<BTreeMap<String, Box<dyn PwmControl>>> {
    let mut actuators: BTreeMap<String, Box<dyn PwmControl>> = BTreeMap::new();
    for (fan_id, fan) in &settings.fans {
        let actuator =
            HwmonActuator::open(fan_id, &fan.pwm_path, &fan.mode_path, settings.mode_codes)?;
        info!(
            "{}: driven by {} from {}",
            fan_id,
            fan.pwm_path.display(),
            fan.reference_gpu
        );
        actuators.insert(fan_id.clone(), Box::new(actuator));
    }
    Ok(actuators)
}

/// Host side fan daemon: telemetry listener plus control loop.
pub struct Daemon {
    controller: Controller,
    session: SessionManager,
}

impl Daemon {
    /// Open every fan, put them at the initial duty and start listening.
    pub async fn start(settings: &ServerSettings) -> Result<Self> {
        let actuators = open_actuators(settings)?;
        let table = FanTable::new(settings);

        let mut controller = Controller::new(settings, table.clone(), actuators);
        controller.tick(Instant::now());

        let session = SessionManager::bind(
            &settings.host,
            settings.port,
            table,
            settings.staleness_timeout,
        )
        .await?;

        Ok(Self {
            controller,
            session,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.session.local_addr()
    }

    /// Control the fans until `shutdown` resolves, then release them.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) {
        let Self {
            mut controller,
            session,
        } = self;

        tokio::select! {
            _ = session.run() => {},
            _ = controller.run() => {},
            _ = shutdown => info!("Shutting down fan control"),
        }

        controller.shutdown();
    }
}
