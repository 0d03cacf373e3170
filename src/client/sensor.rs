use crate::client::nvgpu::NvGpu;
use crate::common::config::SensorSource;
use crate::common::error::{FanError, Result};
use crate::common::protocol::TemperatureSample;
use log::{debug, error, info};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Reads one temperature per configured GPU.
///
/// Failing sensors are reported once when they start failing and once when
/// they recover; repeats in between only show up at debug level.
pub struct SensorReader {
    sensors: BTreeMap<String, SensorSource>,
    nvml: Option<NvGpu>,
    failing: BTreeSet<String>,
}

impl SensorReader {
    /// Open every configured sensor, refusing to start if one is missing.
    pub fn new(sensors: BTreeMap<String, SensorSource>) -> Result<Self> {
        let wants_nvml = sensors
            .values()
            .any(|s| matches!(s, SensorSource::Nvml { .. }));

        let nvml = if wants_nvml {
            let nvml = NvGpu::init()
                .map_err(|e| FanError::config(format!("NVML unavailable: {}", e)))?;
            Some(nvml)
        } else {
            None
        };

        for (gpu_id, source) in &sensors {
            match source {
                SensorSource::Hwmon { temp_path } => {
                    if !temp_path.exists() {
                        return Err(FanError::config(format!(
                            "temperature sensor for {} not found: {}",
                            gpu_id,
                            temp_path.display()
                        )));
                    }
                    info!("Using temperature sensor for {}: {}", gpu_id, temp_path.display());
                }
                SensorSource::Nvml { nvml_index } => {
                    let name = nvml
                        .as_ref()
                        .map(|n| n.probe(*nvml_index))
                        .transpose()
                        .map_err(|e| {
                            FanError::config(format!(
                                "NVML device {} for {}: {}",
                                nvml_index, gpu_id, e
                            ))
                        })?
                        .unwrap_or_default();
                    info!("Using NVML device {} ({}) for {}", nvml_index, name, gpu_id);
                }
            }
        }

        info!("Monitoring {} temperature sensor(s)", sensors.len());

        Ok(Self {
            sensors,
            nvml,
            failing: BTreeSet::new(),
        })
    }

    pub fn gpu_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.sensors.keys().map(String::as_str)
    }

    /// Take a single reading from one GPU's sensor.
    pub fn read(&self, gpu_id: &str, sequence: u64) -> Result<TemperatureSample> {
        let source = self
            .sensors
            .get(gpu_id)
            .ok_or_else(|| FanError::sensor(gpu_id, "not configured"))?;

        let value = match source {
            SensorSource::Hwmon { temp_path } => {
                read_millidegree(temp_path).map_err(|e| FanError::sensor(gpu_id, e))?
            }
            SensorSource::Nvml { nvml_index } => self
                .nvml
                .as_ref()
                .ok_or_else(|| FanError::sensor(gpu_id, "NVML not initialized"))?
                .temperature_millidegree(*nvml_index)
                .map_err(|e| FanError::sensor(gpu_id, e))?,
        };

        Ok(TemperatureSample {
            gpu_id: gpu_id.to_string(),
            value_millidegree: value,
            sequence,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Read every sensor, skipping the ones that fail this tick.
    pub fn sample_all(&mut self, sequence: u64) -> Vec<TemperatureSample> {
        let mut samples = Vec::with_capacity(self.sensors.len());
        let ids: Vec<String> = self.sensors.keys().cloned().collect();

        for gpu_id in ids {
            match self.read(&gpu_id, sequence) {
                Ok(sample) => {
                    if self.failing.remove(&gpu_id) {
                        info!("Sensor for {} recovered", gpu_id);
                    }
                    debug!(
                        "{}: {:.1}°C",
                        gpu_id,
                        sample.value_millidegree as f64 / 1000.0
                    );
                    samples.push(sample);
                }
                Err(e) => {
                    if self.failing.insert(gpu_id) {
                        error!("{}", e);
                    } else {
                        debug!("{}", e);
                    }
                }
            }
        }

        samples
    }
}

fn read_millidegree(path: &Path) -> std::result::Result<i64, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    raw.trim()
        .parse::<i64>()
        .map_err(|e| format!("{}: {:?} is not an integer ({})", path.display(), raw.trim(), e))
}
