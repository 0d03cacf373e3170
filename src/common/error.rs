use thiserror::Error;

/// Result type used across the fan control core
pub type Result<T> = std::result::Result<T, FanError>;

/// Failures the fan control core can report.
///
/// Staleness is deliberately absent: a GPU whose telemetry went quiet is a
/// state (`Freshness::Stale`), not an error.
#[derive(Error, Debug)]
pub enum FanError {
    /// A temperature sensor could not be read or parsed this tick
    #[error("sensor for {gpu_id} unavailable: {reason}")]
    SensorUnavailable { gpu_id: String, reason: String },

    /// The telemetry connection could not be opened or written in time
    #[error("telemetry link failure: {0}")]
    LinkFailure(String),

    /// A PWM or mode control file rejected a write
    #[error("actuation failed for {fan_id}: {source}")]
    Actuation {
        fan_id: String,
        #[source]
        source: std::io::Error,
    },

    /// Startup configuration is ambiguous, inconsistent or points at hardware we cannot drive
    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    /// A telemetry frame could not be decoded
    #[error("malformed telemetry frame: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FanError {
    pub fn config(msg: impl Into<String>) -> Self {
        FanError::ConfigValidation(msg.into())
    }

    pub fn sensor(gpu_id: impl Into<String>, reason: impl ToString) -> Self {
        FanError::SensorUnavailable {
            gpu_id: gpu_id.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_device() {
        let err = FanError::sensor("gpu0", "invalid digit found in string");
        assert_eq!(
            err.to_string(),
            "sensor for gpu0 unavailable: invalid digit found in string"
        );

        let err = FanError::Actuation {
            fan_id: "gpu1".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().starts_with("actuation failed for gpu1"));
    }
}
