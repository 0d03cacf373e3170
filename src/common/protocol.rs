use crate::common::error::{FanError, Result};
use serde::{Deserialize, Serialize};

/// Longest line the host accepts for a single frame
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Default TCP port for telemetry
pub const DEFAULT_PORT: u16 = 7777;

/// One temperature reading taken inside the guest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemperatureSample {
    pub gpu_id: String,
    pub value_millidegree: i64,
    pub sequence: u64,
    /// Guest wall-clock time of the reading, milliseconds since the Unix epoch
    pub timestamp_ms: i64,
}

/// Telemetry frame sent once per client tick.
///
/// An empty `samples` list is a heartbeat: the guest is alive but could not
/// read any sensor this tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelemetryFrame {
    pub version: u8,
    pub sequence: u64,
    pub sent_at_ms: i64,
    pub samples: Vec<TemperatureSample>,
}

impl TelemetryFrame {
    pub const CURRENT_VERSION: u8 = 1;

    pub fn new(sequence: u64, samples: Vec<TemperatureSample>) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            sequence,
            sent_at_ms: chrono::Utc::now().timestamp_millis(),
            samples,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.samples.is_empty()
    }

    /// Encode as a single newline-terminated JSON line
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut line =
            serde_json::to_vec(self).map_err(|e| FanError::Protocol(e.to_string()))?;
        line.push(b'\n');
        Ok(line)
    }

    /// Decode one line (with or without its trailing newline)
    pub fn decode(line: &str) -> Result<Self> {
        if line.len() > MAX_FRAME_LEN {
            return Err(FanError::Protocol(format!(
                "frame of {} bytes exceeds {} byte limit",
                line.len(),
                MAX_FRAME_LEN
            )));
        }

        let frame: TelemetryFrame = serde_json::from_str(line.trim_end())
            .map_err(|e| FanError::Protocol(e.to_string()))?;

        if frame.version != Self::CURRENT_VERSION {
            return Err(FanError::Protocol(format!(
                "unsupported frame version {} (expected {})",
                frame.version,
                Self::CURRENT_VERSION
            )));
        }

        Ok(frame)
    }
}
