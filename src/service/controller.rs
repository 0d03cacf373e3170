use crate::common::config::ServerSettings;
use crate::common::curve::{CurveEngine, duty_to_percent};
use crate::service::actuator::PwmControl;
use crate::service::session::watchdog;
use crate::service::state::{FanTable, Freshness};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval};

/// Periodic control loop: turns the latest telemetry into fan duties.
///
/// Owns the actuators. Dropping the controller releases every fan at the
/// shutdown duty unless [`Controller::shutdown`] already did.
pub struct Controller {
    table: FanTable,
    actuators: BTreeMap<String, Box<dyn PwmControl>>,
    sleep_interval: Duration,
    staleness_timeout: Duration,
    failsafe_duty: u8,
    initial_duty: u8,
    shutdown_duty: u8,
    restore_auto: bool,
    released: bool,
}

impl Controller {
    pub fn new(
        settings: &ServerSettings,
        table: FanTable,
        actuators: BTreeMap<String, Box<dyn PwmControl>>,
    ) -> Self {
        Self {
            table,
            actuators,
            sleep_interval: settings.sleep_interval,
            staleness_timeout: settings.staleness_timeout,
            failsafe_duty: settings.failsafe_duty,
            initial_duty: settings.initial_duty,
            shutdown_duty: settings.shutdown_duty,
            restore_auto: settings.restore_auto_on_exit,
            released: false,
        }
    }

    pub fn table(&self) -> &FanTable {
        &self.table
    }

    /// Run one control step for every fan.
    pub fn tick(&mut self, now: Instant) {
        let mut states = self.table.lock();
        watchdog(&mut states, now, self.staleness_timeout);

        for (fan_id, state) in states.iter_mut() {
            let Some(actuator) = self.actuators.get_mut(fan_id) else {
                continue;
            };

            let duty = match state.freshness {
                Freshness::Never => self.initial_duty,
                Freshness::Stale => self.failsafe_duty,
                Freshness::Fresh => match &state.last_sample {
                    Some(sample) => CurveEngine::evaluate(
                        &state.curve,
                        &mut state.hysteresis,
                        sample.value_millidegree,
                    ),
                    None => self.failsafe_duty,
                },
            };

            if state.last_duty_applied == Some(duty) {
                continue;
            }

            match actuator.apply(duty) {
                Ok(()) => {
                    if state.degraded {
                        info!("{}: fan control recovered", fan_id);
                        state.degraded = false;
                    }
                    debug!(
                        "{}: duty {} ({:.0}%), {:?}",
                        fan_id,
                        duty,
                        duty_to_percent(duty),
                        state.freshness
                    );
                    state.last_duty_applied = Some(duty);
                }
                Err(e) => {
                    if !state.degraded {
                        error!("{}", e);
                        state.degraded = true;
                    } else {
                        debug!("{}", e);
                    }
                }
            }
        }
    }

    /// Tick at the configured interval until the future is dropped.
    pub async fn run(&mut self) {
        let mut ticker = interval(self.sleep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.tick(Instant::now());
        }
    }

    /// Leave every fan at the shutdown duty. Only the first call does anything.
    pub fn shutdown(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        info!(
            "Releasing {} fan(s) at duty {}",
            self.actuators.len(),
            self.shutdown_duty
        );
        for (fan_id, actuator) in self.actuators.iter_mut() {
            if let Err(e) = actuator.release(self.shutdown_duty, self.restore_auto) {
                warn!("{}: failed to release fan: {}", fan_id, e);
            }
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
