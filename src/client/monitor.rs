use crate::client::link::{Delivery, TelemetryLink};
use crate::client::sensor::SensorReader;
use crate::common::config::ClientSettings;
use crate::common::error::Result;
use crate::common::protocol::TelemetryFrame;
use log::{debug, info};
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};

/// Guest side loop: sample every GPU once per interval and push the frame.
pub struct TemperatureMonitor {
    reader: SensorReader,
    link: TelemetryLink,
    interval: Duration,
    sequence: u64,
}

impl TemperatureMonitor {
    pub fn new(settings: &ClientSettings) -> Result<Self> {
        let reader = SensorReader::new(settings.sensors.clone())?;
        Ok(Self::with_reader(reader, settings))
    }

    fn with_reader(reader: SensorReader, settings: &ClientSettings) -> Self {
        Self {
            reader,
            link: TelemetryLink::new(settings),
            interval: settings.sleep_interval,
            sequence: 0,
        }
    }

    pub fn link(&self) -> &TelemetryLink {
        &self.link
    }

    /// One sampling round. A frame is always offered, even when every sensor
    /// failed, so the server still sees the guest is alive.
    pub async fn tick(&mut self) -> Delivery {
        self.sequence += 1;
        let samples = self.reader.sample_all(self.sequence);
        let frame = TelemetryFrame::new(self.sequence, samples);

        if frame.is_heartbeat() {
            debug!("No readings this tick, sending heartbeat {}", frame.sequence);
        }

        self.link.send(&frame).await
    }

    pub async fn run(&mut self) {
        info!(
            "Reporting {} GPU(s) every {:?}",
            self.reader.gpu_ids().count(),
            self.interval
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }
}
