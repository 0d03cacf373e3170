use log::{debug, error, info};
use nvml_wrapper::Nvml;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::error::NvmlError;

/// NVML handle shared by every NVIDIA sensor in the guest
pub struct NvGpu {
    nvml: Nvml,
}

impl NvGpu {
    /// Initialize NVML and log the devices the guest can see
    pub fn init() -> Result<Self, NvmlError> {
        debug!("Starting NVML initialization");
        let nvml = Nvml::init().map_err(|e| {
            error!("NVML initialization failed: {}", e);
            e
        })?;

        let count = nvml.device_count()?;
        info!("NVML sees {} NVIDIA device(s)", count);

        Ok(Self { nvml })
    }

    /// Check the device exists and return its marketing name
    pub fn probe(&self, index: u32) -> Result<String, NvmlError> {
        let device = self.nvml.device_by_index(index)?;
        let name = device.name()?;
        debug!("NVML device {}: {}", index, name);
        Ok(name)
    }

    /// Core temperature in millidegrees, matching hwmon units
    pub fn temperature_millidegree(&self, index: u32) -> Result<i64, NvmlError> {
        let device = self.nvml.device_by_index(index)?;
        let celsius = device.temperature(TemperatureSensor::Gpu)?;
        Ok(i64::from(celsius) * 1000)
    }
}
