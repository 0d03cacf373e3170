use crate::common::config::ServerSettings;
use crate::common::curve::{FanCurve, Hysteresis};
use crate::common::protocol::TemperatureSample;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// How recent the telemetry driving a fan is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Nothing received since start
    Never,
    Fresh,
    /// Data used to arrive but has gone quiet for longer than the timeout
    Stale,
}

/// Everything the controller knows about one controlled fan.
#[derive(Debug, Clone)]
pub struct GpuState {
    pub fan_id: String,
    pub reference_gpu: String,
    pub curve: FanCurve,
    pub last_sample: Option<TemperatureSample>,
    pub last_seen: Option<Instant>,
    pub last_duty_applied: Option<u8>,
    pub hysteresis: Hysteresis,
    pub freshness: Freshness,
    /// Set while actuation keeps failing, so the failure is logged once
    pub degraded: bool,
}

impl GpuState {
    pub fn new(fan_id: &str, reference_gpu: &str, curve: FanCurve) -> Self {
        Self {
            fan_id: fan_id.to_string(),
            reference_gpu: reference_gpu.to_string(),
            curve,
            last_sample: None,
            last_seen: None,
            last_duty_applied: None,
            hysteresis: Hysteresis::default(),
            freshness: Freshness::Never,
            degraded: false,
        }
    }

    pub fn record(&mut self, sample: TemperatureSample, now: Instant) {
        self.last_sample = Some(sample);
        self.last_seen = Some(now);
    }

    /// Make the data count as stale right away, e.g. when the sender hung up.
    pub fn expire(&mut self) {
        self.last_seen = None;
    }

    /// Freshness this state should have at `now`. Does not mutate.
    pub fn classify(&self, now: Instant, timeout: Duration) -> Freshness {
        match (self.last_seen, &self.last_sample) {
            (Some(seen), Some(_)) if now.saturating_duration_since(seen) <= timeout => {
                Freshness::Fresh
            }
            (_, Some(_)) => Freshness::Stale,
            (_, None) => Freshness::Never,
        }
    }
}

/// Fan states shared between the session manager and the control loop.
#[derive(Clone)]
pub struct FanTable {
    inner: Arc<Mutex<BTreeMap<String, GpuState>>>,
}

impl FanTable {
    pub fn new(settings: &ServerSettings) -> Self {
        let states = settings
            .fans
            .iter()
            .map(|(fan_id, fan)| {
                (
                    fan_id.clone(),
                    GpuState::new(fan_id, &fan.reference_gpu, fan.curve.clone()),
                )
            })
            .collect();

        Self {
            inner: Arc::new(Mutex::new(states)),
        }
    }

    /// Lock the table. A panic elsewhere never leaves the fans unmanaged, so a
    /// poisoned lock is taken over rather than propagated.
    pub fn lock(&self) -> MutexGuard<'_, BTreeMap<String, GpuState>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop every GPU's data timestamp so the next tick fails safe.
    pub fn expire_all(&self) {
        for state in self.lock().values_mut() {
            state.expire();
        }
    }
}
