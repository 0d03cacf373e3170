use crate::common::config::ModeCodes;
use crate::common::error::{FanError, Result};
use log::{debug, info};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Something that can drive one fan's PWM duty.
#[cfg_attr(test, mockall::automock)]
pub trait PwmControl: Send {
    /// Switch to manual control if needed and write `duty` (0-255).
    fn apply(&mut self, duty: u8) -> Result<()>;

    /// Leave the fan at `duty`, optionally handing it back to automatic control.
    fn release(&mut self, duty: u8, restore_auto: bool) -> Result<()>;
}

/// Fan driven through hwmon `pwmN` / `pwmN_enable` files.
pub struct HwmonActuator {
    fan_id: String,
    pwm_path: PathBuf,
    mode_path: PathBuf,
    codes: ModeCodes,
    manual: bool,
}

impl HwmonActuator {
    /// Check both control files are writable. Nothing is written yet.
    pub fn open(fan_id: &str, pwm_path: &Path, mode_path: &Path, codes: ModeCodes) -> Result<Self> {
        for path in [pwm_path, mode_path] {
            OpenOptions::new().write(true).open(path).map_err(|e| {
                FanError::config(format!(
                    "{}: cannot open {} for writing: {}",
                    fan_id,
                    path.display(),
                    e
                ))
            })?;
        }
        debug!(
            "{}: pwm {} mode {}",
            fan_id,
            pwm_path.display(),
            mode_path.display()
        );

        Ok(Self {
            fan_id: fan_id.to_string(),
            pwm_path: pwm_path.to_path_buf(),
            mode_path: mode_path.to_path_buf(),
            codes,
            manual: false,
        })
    }

    fn write(&self, path: &Path, value: u8) -> Result<()> {
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)
            .and_then(|mut file| file.write_all(value.to_string().as_bytes()))
            .map_err(|source| FanError::Actuation {
                fan_id: self.fan_id.clone(),
                source,
            })
    }
}

impl PwmControl for HwmonActuator {
    fn apply(&mut self, duty: u8) -> Result<()> {
        if !self.manual {
            self.write(&self.mode_path, self.codes.manual)?;
            self.manual = true;
            info!("{}: switched to manual fan control", self.fan_id);
        }
        self.write(&self.pwm_path, duty)
    }

    fn release(&mut self, duty: u8, restore_auto: bool) -> Result<()> {
        let parked = self.apply(duty);
        if !restore_auto {
            return parked;
        }

        // Auto mode is attempted even when the duty write failed
        let restored = self.write(&self.mode_path, self.codes.auto);
        if restored.is_ok() {
            self.manual = false;
            info!("{}: returned to automatic fan control", self.fan_id);
        }
        parked.and(restored)
    }
}
