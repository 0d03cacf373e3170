//! Temperature to duty-cycle mapping.
//!
//! A curve maps temperatures (millidegrees Celsius) to PWM duty values on the
//! canonical 0-255 scale. Points are linearly interpolated; anything outside
//! the configured range clamps to the nearest end point. Hysteresis memory is
//! kept per fan so a temperature hovering around a breakpoint does not make
//! the fan hunt.

use crate::common::error::{FanError, Result};

/// Highest value a hwmon PWM control file accepts
pub const PWM_MAX: u8 = 255;

/// Convert a 0-100 percentage into a 0-255 duty value, rounding down.
pub fn percent_to_duty(percent: u8) -> u8 {
    (u32::from(percent.min(100)) * u32::from(PWM_MAX) / 100) as u8
}

pub fn duty_to_percent(duty: u8) -> f64 {
    f64::from(duty) * 100.0 / f64::from(PWM_MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurvePoint {
    /// Threshold in millidegrees Celsius
    pub temp: i64,
    /// Duty value (0-255)
    pub duty: u8,
}

/// Validated fan curve plus its hysteresis band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanCurve {
    points: Vec<CurvePoint>,
    hysteresis: i64,
}

impl FanCurve {
    /// Build a curve from parallel threshold/duty arrays already on the 0-255 scale.
    pub fn new(temps: &[i64], duties: &[i64], hysteresis: i64) -> Result<Self> {
        if temps.len() != duties.len() {
            return Err(FanError::config(format!(
                "curve has {} temperatures but {} duty values",
                temps.len(),
                duties.len()
            )));
        }
        if temps.len() < 2 {
            return Err(FanError::config("curve needs at least 2 points"));
        }
        if hysteresis < 0 {
            return Err(FanError::config(format!(
                "hysteresis must not be negative, got {}",
                hysteresis
            )));
        }

        let mut points: Vec<CurvePoint> = Vec::with_capacity(temps.len());
        for (i, (&temp, &duty)) in temps.iter().zip(duties).enumerate() {
            if !(0..=i64::from(PWM_MAX)).contains(&duty) {
                return Err(FanError::config(format!(
                    "duty value {} at point {} is outside 0-{}",
                    duty, i, PWM_MAX
                )));
            }
            if let Some(prev) = points.last().copied() {
                if temp <= prev.temp {
                    return Err(FanError::config(format!(
                        "curve temperatures must be strictly increasing (point {})",
                        i
                    )));
                }
                if (duty as u8) < prev.duty {
                    return Err(FanError::config(format!(
                        "curve duty values must not decrease (point {})",
                        i
                    )));
                }
            }
            points.push(CurvePoint {
                temp,
                duty: duty as u8,
            });
        }

        Ok(Self { points, hysteresis })
    }

    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    pub fn hysteresis(&self) -> i64 {
        self.hysteresis
    }

    /// Interpolate the duty value for a temperature, clamping outside the curve.
    pub fn interpolate(&self, temp: i64) -> u8 {
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];

        if temp <= first.temp {
            return first.duty;
        }
        if temp >= last.temp {
            return last.duty;
        }

        for pair in self.points.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if temp <= hi.temp {
                let span = hi.temp - lo.temp;
                let rise = i64::from(hi.duty) - i64::from(lo.duty);
                let duty = i64::from(lo.duty) + (temp - lo.temp) * rise / span;
                return duty as u8;
            }
        }

        last.duty
    }
}

/// Direction of travel recorded at the last accepted duty change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Rising,
    Falling,
    #[default]
    None,
}

/// Per-fan hysteresis memory: travel direction, the temperature at the last
/// accepted change and the duty accepted then.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hysteresis {
    direction: Direction,
    reference: Option<i64>,
    duty: Option<u8>,
}

impl Hysteresis {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn reference(&self) -> Option<i64> {
        self.reference
    }

    /// Forget all history so the next sample is accepted unconditionally.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub struct CurveEngine;

impl CurveEngine {
    /// Map a temperature to the duty the fan should run at.
    ///
    /// The interpolated target only replaces the held duty once the
    /// temperature has moved at least one hysteresis band away from the
    /// reference in the recorded direction, or strictly more than one band
    /// in the opposite direction.
    pub fn evaluate(curve: &FanCurve, memory: &mut Hysteresis, temp: i64) -> u8 {
        let target = curve.interpolate(temp);

        let (Some(reference), Some(held)) = (memory.reference, memory.duty) else {
            memory.reference = Some(temp);
            memory.duty = Some(target);
            return target;
        };

        // Readings come off the wire, so any i64 is possible
        let delta = temp.saturating_sub(reference);
        let travel = match delta {
            d if d > 0 => Direction::Rising,
            d if d < 0 => Direction::Falling,
            _ => Direction::None,
        };
        let band = curve.hysteresis().unsigned_abs();
        let distance = delta.unsigned_abs();

        let accept = match (memory.direction, travel) {
            (_, Direction::None) => false,
            (Direction::None, _) => distance >= band,
            (recorded, moving) if recorded == moving => distance >= band,
            _ => distance > band,
        };

        if accept {
            memory.direction = travel;
            memory.reference = Some(temp);
            memory.duty = Some(target);
            target
        } else {
            held
        }
    }
}
