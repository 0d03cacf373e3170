use crate::common::curve::{FanCurve, percent_to_duty};
use crate::common::error::{FanError, Result};
use crate::common::protocol::DEFAULT_PORT;
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SERVER_CONFIG_NAME: &str = "fancontrol-server.json";
pub const CLIENT_CONFIG_NAME: &str = "fancontrol-client.json";
const CONFIG_DIR: &str = "vmfan";

/// Fan id the single `pwm_path`/`mode_path` pair is registered under
pub const LEGACY_FAN_ID: &str = "gpu0";

/// Scale the `pwms` arrays are written in
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PwmUnit {
    #[default]
    Raw,
    Percent,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct FanEntry {
    pub pwm_path: PathBuf,
    pub mode_path: PathBuf,
    /// GPU whose temperature drives this fan, defaults to the fan id
    #[serde(default)]
    pub reference_gpu: Option<String>,
    #[serde(default)]
    pub temps: Option<Vec<i64>>,
    #[serde(default)]
    pub pwms: Option<Vec<i64>>,
    #[serde(default)]
    pub hysteresis: Option<i64>,
}

/// Host daemon configuration as written on disk
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerFileConfig {
    pub temps: Vec<i64>,
    pub pwms: Vec<i64>,
    pub pwm_unit: PwmUnit,
    pub hysteresis: i64,
    pub sleep_interval: f64,
    pub staleness_timeout: Option<f64>,
    pub host: String,
    pub port: u16,
    pub failsafe_fan_percent: i64,
    pub initial_fan_percent: i64,
    pub shutdown_fan_percent: Option<i64>,
    pub restore_auto_on_exit: bool,
    pub mode_manual: u8,
    pub mode_auto: u8,
    pub pwm_path: Option<PathBuf>,
    pub mode_path: Option<PathBuf>,
    pub fans: BTreeMap<String, FanEntry>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            temps: vec![35000, 55000, 80000, 90000],
            pwms: vec![0, 100, 153, 255],
            pwm_unit: PwmUnit::Raw,
            hysteresis: 6000,
            sleep_interval: 1.0,
            staleness_timeout: None,
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            failsafe_fan_percent: 80,
            initial_fan_percent: 0,
            shutdown_fan_percent: None,
            restore_auto_on_exit: true,
            mode_manual: 1,
            mode_auto: 2,
            pwm_path: None,
            mode_path: None,
            fans: BTreeMap::new(),
        }
    }
}

/// hwmon enable codes for manual and firmware control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeCodes {
    pub manual: u8,
    pub auto: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FanSettings {
    pub pwm_path: PathBuf,
    pub mode_path: PathBuf,
    pub reference_gpu: String,
    pub curve: FanCurve,
}

/// Validated, immutable host daemon settings
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub sleep_interval: Duration,
    pub staleness_timeout: Duration,
    pub failsafe_duty: u8,
    pub initial_duty: u8,
    pub shutdown_duty: u8,
    pub restore_auto_on_exit: bool,
    pub mode_codes: ModeCodes,
    pub fans: BTreeMap<String, FanSettings>,
}

impl ServerFileConfig {
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        load_or_default(explicit, SERVER_CONFIG_NAME)
    }

    /// Check every field and fold the legacy and multi-fan forms into one fan map.
    pub fn validate(self) -> Result<ServerSettings> {
        let sleep_interval = seconds("sleep_interval", self.sleep_interval)?;
        let staleness_timeout = match self.staleness_timeout {
            Some(secs) => seconds("staleness_timeout", secs)?,
            None => sleep_interval * 2,
        };
        if staleness_timeout < sleep_interval {
            return Err(FanError::config(format!(
                "staleness_timeout ({:?}) must not be shorter than sleep_interval ({:?})",
                staleness_timeout, sleep_interval
            )));
        }

        let failsafe_duty = percent("failsafe_fan_percent", self.failsafe_fan_percent)?;
        let initial_duty = percent("initial_fan_percent", self.initial_fan_percent)?;
        let shutdown_duty = match self.shutdown_fan_percent {
            Some(p) => percent("shutdown_fan_percent", p)?,
            None => failsafe_duty,
        };

        if self.mode_manual == self.mode_auto {
            return Err(FanError::config(format!(
                "mode_manual and mode_auto must differ, both are {}",
                self.mode_manual
            )));
        }

        let entries = self.fan_entries()?;
        let mut fans = BTreeMap::new();
        let mut pwm_paths = BTreeSet::new();

        for (fan_id, entry) in entries {
            if !pwm_paths.insert(entry.pwm_path.clone()) {
                return Err(FanError::config(format!(
                    "fan {} reuses pwm_path {} already assigned to another fan",
                    fan_id,
                    entry.pwm_path.display()
                )));
            }

            let temps = entry.temps.as_deref().unwrap_or(&self.temps);
            let pwms = entry.pwms.as_deref().unwrap_or(&self.pwms);
            let duties = normalize_duties(self.pwm_unit, pwms)
                .map_err(|e| FanError::config(format!("fan {}: {}", fan_id, e)))?;
            let hysteresis = entry.hysteresis.unwrap_or(self.hysteresis);

            let curve = FanCurve::new(temps, &duties, hysteresis).map_err(|e| match e {
                FanError::ConfigValidation(msg) => {
                    FanError::config(format!("fan {}: {}", fan_id, msg))
                }
                other => other,
            })?;

            let reference_gpu = entry.reference_gpu.unwrap_or_else(|| fan_id.clone());
            fans.insert(
                fan_id,
                FanSettings {
                    pwm_path: entry.pwm_path,
                    mode_path: entry.mode_path,
                    reference_gpu,
                    curve,
                },
            );
        }

        debug!("Validated server configuration for {} fan(s)", fans.len());

        Ok(ServerSettings {
            host: self.host,
            port: self.port,
            sleep_interval,
            staleness_timeout,
            failsafe_duty,
            initial_duty,
            shutdown_duty,
            restore_auto_on_exit: self.restore_auto_on_exit,
            mode_codes: ModeCodes {
                manual: self.mode_manual,
                auto: self.mode_auto,
            },
            fans,
        })
    }

    fn fan_entries(&self) -> Result<BTreeMap<String, FanEntry>> {
        let legacy = match (&self.pwm_path, &self.mode_path) {
            (Some(pwm), Some(mode)) => Some(FanEntry {
                pwm_path: pwm.clone(),
                mode_path: mode.clone(),
                ..FanEntry::default()
            }),
            (None, None) => None,
            _ => {
                return Err(FanError::config(
                    "pwm_path and mode_path must be given together",
                ));
            }
        };

        match legacy {
            None if self.fans.is_empty() => Err(FanError::config(
                "no fans configured: set pwm_path/mode_path or a fans map",
            )),
            None => Ok(self.fans.clone()),
            Some(entry) if self.fans.is_empty() => {
                Ok(BTreeMap::from([(LEGACY_FAN_ID.to_string(), entry)]))
            }
            Some(entry) => {
                let agrees = self.fans.len() == 1
                    && self.fans.get(LEGACY_FAN_ID).is_some_and(|fan| {
                        fan.pwm_path == entry.pwm_path && fan.mode_path == entry.mode_path
                    });
                if !agrees {
                    return Err(FanError::config(format!(
                        "legacy pwm_path/mode_path describe fan {} but the fans map lists [{}]",
                        LEGACY_FAN_ID,
                        self.fans.keys().cloned().collect::<Vec<_>>().join(", ")
                    )));
                }
                warn!("Both legacy and fans map configured; they agree, using the fans map");
                Ok(self.fans.clone())
            }
        }
    }
}

/// Where a guest GPU temperature comes from
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum SensorSource {
    /// hwmon `temp*_input` file reporting millidegrees
    Hwmon { temp_path: PathBuf },
    /// NVIDIA device index, read through NVML
    Nvml { nvml_index: u32 },
}

/// Guest telemetry client configuration as written on disk
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ClientFileConfig {
    pub sleep_interval: f64,
    pub host: String,
    pub port: u16,
    pub backoff_initial: f64,
    pub backoff_max: f64,
    pub gpus: BTreeMap<String, SensorSource>,
}

impl Default for ClientFileConfig {
    fn default() -> Self {
        Self {
            sleep_interval: 1.0,
            host: String::new(),
            port: DEFAULT_PORT,
            backoff_initial: 1.0,
            backoff_max: 30.0,
            gpus: BTreeMap::new(),
        }
    }
}

/// Validated, immutable telemetry client settings
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
    pub sleep_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub sensors: BTreeMap<String, SensorSource>,
}

impl ClientFileConfig {
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        load_or_default(explicit, CLIENT_CONFIG_NAME)
    }

    pub fn validate(self) -> Result<ClientSettings> {
        if self.host.trim().is_empty() {
            return Err(FanError::config("host of the fan daemon must be set"));
        }
        if self.port == 0 {
            return Err(FanError::config("port must not be 0"));
        }
        if self.gpus.is_empty() {
            return Err(FanError::config("no GPU temperature sensors configured"));
        }

        let sleep_interval = seconds("sleep_interval", self.sleep_interval)?;
        let backoff_initial = seconds("backoff_initial", self.backoff_initial)?;
        let backoff_max = seconds("backoff_max", self.backoff_max)?;
        if backoff_max < backoff_initial {
            return Err(FanError::config(
                "backoff_max must not be shorter than backoff_initial",
            ));
        }

        Ok(ClientSettings {
            host: self.host,
            port: self.port,
            sleep_interval,
            backoff_initial,
            backoff_max,
            sensors: self.gpus,
        })
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(value) {
        Ok(d) if !d.is_zero() => Ok(d),
        _ => Err(FanError::config(format!(
            "{} must be a positive number of seconds, got {}",
            field, value
        ))),
    }
}

fn percent(field: &str, value: i64) -> Result<u8> {
    if !(0..=100).contains(&value) {
        return Err(FanError::config(format!(
            "{} must be between 0 and 100, got {}",
            field, value
        )));
    }
    Ok(percent_to_duty(value as u8))
}

fn normalize_duties(unit: PwmUnit, pwms: &[i64]) -> std::result::Result<Vec<i64>, String> {
    match unit {
        PwmUnit::Raw => Ok(pwms.to_vec()),
        PwmUnit::Percent => pwms
            .iter()
            .map(|&p| {
                if (0..=100).contains(&p) {
                    Ok(i64::from(percent_to_duty(p as u8)))
                } else {
                    Err(format!("percent duty {} is outside 0-100", p))
                }
            })
            .collect(),
    }
}

/// Candidate locations for a config file, most global first
pub fn search_paths(name: &str) -> Vec<PathBuf> {
    let mut paths = vec![Path::new("/etc").join(CONFIG_DIR).join(name)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join(CONFIG_DIR).join(name));
    }
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(name));
    }
    paths
}

fn load_or_default<T: DeserializeOwned + Default>(
    explicit: Option<&Path>,
    name: &str,
) -> Result<T> {
    if let Some(path) = explicit {
        info!("Loading configuration from: {}", path.display());
        return parse_file(path);
    }

    debug!("Searching for {}", name);
    match search_paths(name).into_iter().find(|p| p.exists()) {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            parse_file(&path)
        }
        None => {
            info!("No {} found, using default configuration", name);
            Ok(T::default())
        }
    }
}

fn parse_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        error!("Failed to read config file '{}': {}", path.display(), e);
        FanError::config(format!("cannot read {}: {}", path.display(), e))
    })?;

    debug!("Configuration file size: {} bytes", contents.len());

    let is_toml = path.extension().is_some_and(|ext| ext == "toml");
    let parsed = if is_toml {
        toml::from_str(&contents).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&contents).map_err(|e| e.to_string())
    };

    parsed.map_err(|e| {
        error!("Failed to parse configuration '{}': {}", path.display(), e);
        FanError::config(format!("cannot parse {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn legacy_config() -> ServerFileConfig {
        ServerFileConfig {
            pwm_path: Some(PathBuf::from("/sys/class/hwmon/hwmon5/pwm4")),
            mode_path: Some(PathBuf::from("/sys/class/hwmon/hwmon5/pwm4_enable")),
            ..ServerFileConfig::default()
        }
    }

    fn fan(pwm: &str) -> FanEntry {
        FanEntry {
            pwm_path: PathBuf::from(pwm),
            mode_path: PathBuf::from(format!("{}_enable", pwm)),
            ..FanEntry::default()
        }
    }

    #[test]
    fn test_legacy_pair_becomes_gpu0() {
        let settings = legacy_config().validate().unwrap();

        assert_eq!(settings.fans.len(), 1);
        let fan = &settings.fans[LEGACY_FAN_ID];
        assert_eq!(fan.reference_gpu, LEGACY_FAN_ID);
        assert_eq!(fan.pwm_path, PathBuf::from("/sys/class/hwmon/hwmon5/pwm4"));
        assert_eq!(fan.curve.hysteresis(), 6000);
    }

    #[test]
    fn test_defaults_match_deployment_values() {
        let settings = legacy_config().validate().unwrap();

        assert_eq!(settings.port, 7777);
        assert_eq!(settings.host, "0.0.0.0");
        assert_eq!(settings.failsafe_duty, 204);
        assert_eq!(settings.initial_duty, 0);
        assert_eq!(settings.shutdown_duty, 204);
        assert_eq!(settings.sleep_interval, Duration::from_secs(1));
        assert_eq!(settings.staleness_timeout, Duration::from_secs(2));
        assert_eq!(settings.mode_codes, ModeCodes { manual: 1, auto: 2 });
        assert!(settings.restore_auto_on_exit);
    }

    #[test]
    fn test_no_fans_is_rejected() {
        let err = ServerFileConfig::default().validate().unwrap_err();
        assert!(matches!(err, FanError::ConfigValidation(_)));
    }

    #[test]
    fn test_half_legacy_pair_is_rejected() {
        let config = ServerFileConfig {
            pwm_path: Some(PathBuf::from("/tmp/pwm1")),
            ..ServerFileConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_legacy_and_fans_must_agree() {
        let mut config = legacy_config();
        config
            .fans
            .insert("gpu1".to_string(), fan("/sys/class/hwmon/hwmon3/pwm1"));
        assert!(config.validate().is_err());

        let mut config = legacy_config();
        config.fans.insert(
            LEGACY_FAN_ID.to_string(),
            FanEntry {
                pwm_path: PathBuf::from("/sys/class/hwmon/hwmon5/pwm4"),
                mode_path: PathBuf::from("/sys/class/hwmon/hwmon5/pwm4_enable"),
                ..FanEntry::default()
            },
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fans_map_with_reference_and_override() {
        let mut config = ServerFileConfig::default();
        config
            .fans
            .insert("gpu0".to_string(), fan("/sys/class/hwmon/hwmon3/pwm1"));
        config.fans.insert(
            "case".to_string(),
            FanEntry {
                reference_gpu: Some("gpu0".to_string()),
                temps: Some(vec![40000, 70000]),
                pwms: Some(vec![60, 255]),
                hysteresis: Some(2000),
                ..fan("/sys/class/hwmon/hwmon3/pwm2")
            },
        );

        let settings = config.validate().unwrap();
        assert_eq!(settings.fans["case"].reference_gpu, "gpu0");
        assert_eq!(settings.fans["case"].curve.points().len(), 2);
        assert_eq!(settings.fans["case"].curve.hysteresis(), 2000);
        assert_eq!(settings.fans["gpu0"].curve.points().len(), 4);
    }

    #[test]
    fn test_duplicate_pwm_path_is_rejected() {
        let mut config = ServerFileConfig::default();
        config.fans.insert("a".to_string(), fan("/tmp/pwm1"));
        config.fans.insert("b".to_string(), fan("/tmp/pwm1"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_percent_curve_is_normalized() {
        let config = ServerFileConfig {
            pwm_unit: PwmUnit::Percent,
            pwms: vec![0, 40, 60, 100],
            ..legacy_config()
        };
        let settings = config.validate().unwrap();
        let duties: Vec<u8> = settings.fans[LEGACY_FAN_ID]
            .curve
            .points()
            .iter()
            .map(|p| p.duty)
            .collect();
        assert_eq!(duties, vec![0, 102, 153, 255]);

        let config = ServerFileConfig {
            pwm_unit: PwmUnit::Percent,
            pwms: vec![0, 40, 60, 120],
            ..legacy_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_scalars_are_rejected() {
        for config in [
            ServerFileConfig {
                failsafe_fan_percent: 101,
                ..legacy_config()
            },
            ServerFileConfig {
                initial_fan_percent: -1,
                ..legacy_config()
            },
            ServerFileConfig {
                sleep_interval: 0.0,
                ..legacy_config()
            },
            ServerFileConfig {
                staleness_timeout: Some(0.5),
                ..legacy_config()
            },
            ServerFileConfig {
                mode_auto: 1,
                ..legacy_config()
            },
            ServerFileConfig {
                temps: vec![55000, 35000, 80000, 90000],
                ..legacy_config()
            },
        ] {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_load_json_server_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{
                "temps": [30000, 60000],
                "pwms": [50, 200],
                "hysteresis": 3000,
                "sleep_interval": 0.5,
                "failsafe_fan_percent": 90,
                "fans": {{
                    "gpu0": {{ "pwm_path": "/tmp/pwm1", "mode_path": "/tmp/pwm1_enable" }}
                }}
            }}"#
        )
        .unwrap();

        let settings = ServerFileConfig::load(Some(file.path()))
            .unwrap()
            .validate()
            .unwrap();
        assert_eq!(settings.sleep_interval, Duration::from_millis(500));
        assert_eq!(settings.staleness_timeout, Duration::from_secs(1));
        assert_eq!(settings.failsafe_duty, percent_to_duty(90));
        assert_eq!(settings.fans["gpu0"].curve.interpolate(45000), 125);
    }

    #[test]
    fn test_load_toml_client_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
host = "192.168.70.31"
sleep_interval = 2.0

[gpus.gpu0]
temp_path = "/sys/class/hwmon/hwmon2/temp1_input"

[gpus.gpu1]
nvml_index = 0
"#
        )
        .unwrap();

        let settings = ClientFileConfig::load(Some(file.path()))
            .unwrap()
            .validate()
            .unwrap();
        assert_eq!(settings.host, "192.168.70.31");
        assert_eq!(settings.port, 7777);
        assert_eq!(settings.backoff_max, Duration::from_secs(30));
        assert_eq!(
            settings.sensors["gpu0"],
            SensorSource::Hwmon {
                temp_path: PathBuf::from("/sys/class/hwmon/hwmon2/temp1_input")
            }
        );
        assert_eq!(settings.sensors["gpu1"], SensorSource::Nvml { nvml_index: 0 });
    }

    #[test]
    fn test_client_requires_host_and_sensors() {
        assert!(ClientFileConfig::default().validate().is_err());

        let mut config = ClientFileConfig {
            host: "10.0.0.1".to_string(),
            ..ClientFileConfig::default()
        };
        assert!(config.clone().validate().is_err());

        config.gpus.insert(
            "gpu0".to_string(),
            SensorSource::Hwmon {
                temp_path: PathBuf::from("/tmp/temp1_input"),
            },
        );
        assert!(config.clone().validate().is_ok());

        config.backoff_max = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unparseable_file_is_fatal() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            ServerFileConfig::load(Some(file.path())),
            Err(FanError::ConfigValidation(_))
        ));
    }
}
