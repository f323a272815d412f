use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::time::Duration;

use crate::error::Error;
use crate::phase::phase_at;

/// Periodic wave families. `phase` is always in [0, 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaveShape {
    Sine,
    Triangle,
    Square,
    Sawtooth,
}

impl WaveShape {
    pub fn evaluate(self, phase: f64, min: f64, max: f64) -> f64 {
        match self {
            WaveShape::Sine => sine(phase, min, max),
            WaveShape::Triangle => triangle(phase, min, max),
            WaveShape::Square => square(phase, min, max),
            WaveShape::Sawtooth => sawtooth(phase, min, max),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WaveShape::Sine => "sine",
            WaveShape::Triangle => "triangle",
            WaveShape::Square => "square",
            WaveShape::Sawtooth => "sawtooth",
        }
    }
}

impl fmt::Display for WaveShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WaveShape {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sine" | "sin" => Ok(WaveShape::Sine),
            "triangle" | "tri" => Ok(WaveShape::Triangle),
            "square" | "sq" => Ok(WaveShape::Square),
            "sawtooth" | "saw" => Ok(WaveShape::Sawtooth),
            other => Err(Error::validation(format!("unknown wave shape '{}'", other))),
        }
    }
}

// Rounding in mid +/- amp can land one ulp outside the range.
fn bounded(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

pub fn sine(phase: f64, min: f64, max: f64) -> f64 {
    let amplitude = (max - min) / 2.0;
    let mid = (max + min) / 2.0;
    bounded(mid + amplitude * (2.0 * PI * phase).sin(), min, max)
}

/// Rises from `min` to `max` over [0, 0.5), falls back over [0.5, 1).
pub fn triangle(phase: f64, min: f64, max: f64) -> f64 {
    let normalized = if phase < 0.5 {
        phase * 2.0
    } else {
        2.0 - phase * 2.0
    };
    bounded(min + (max - min) * normalized, min, max)
}

/// 50% duty cycle, `max` first.
pub fn square(phase: f64, min: f64, max: f64) -> f64 {
    if phase < 0.5 {
        max
    } else {
        min
    }
}

pub fn sawtooth(phase: f64, min: f64, max: f64) -> f64 {
    bounded(min + (max - min) * phase, min, max)
}

/// Linear interpolation from `start` to `end`, held at `end` once
/// `elapsed >= duration`.
pub fn ramp(start: f64, end: f64, duration: Duration, elapsed: Duration) -> f64 {
    if elapsed >= duration {
        return end;
    }
    let progress = elapsed.as_secs_f64() / duration.as_secs_f64();
    start + (end - start) * progress
}

/// `end + (start - end) * e^(-elapsed / tau)`
pub fn exponential(start: f64, end: f64, tau: Duration, elapsed: Duration) -> f64 {
    if tau.is_zero() {
        return end;
    }
    let delta = start - end;
    end + delta * (-elapsed.as_secs_f64() / tau.as_secs_f64()).exp()
}

/// Steps through `values` once per cycle. An empty table yields 0.0.
pub fn table(values: &[f64], phase: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let index = (phase * values.len() as f64) as usize;
    values[index.min(values.len() - 1)]
}

/// What a channel is asked to produce.
#[derive(Debug, Clone, PartialEq)]
pub enum WaveSpec {
    Constant(f64),
    Periodic {
        shape: WaveShape,
        min: f64,
        max: f64,
        frequency: f64,
    },
    Ramp {
        start: f64,
        end: f64,
        duration: Duration,
    },
    Table {
        values: Arc<[f64]>,
        frequency: f64,
    },
}

impl WaveSpec {
    pub fn periodic(shape: WaveShape, min: f64, max: f64, frequency: f64) -> Self {
        WaveSpec::Periodic { shape, min, max, frequency }
    }

    pub fn ramp(start: f64, end: f64, duration: Duration) -> Self {
        WaveSpec::Ramp { start, end, duration }
    }

    pub fn table(values: impl Into<Arc<[f64]>>, frequency: f64) -> Self {
        WaveSpec::Table { values: values.into(), frequency }
    }

    /// `None` for non-periodic specs.
    pub fn frequency(&self) -> Option<f64> {
        match self {
            WaveSpec::Periodic { frequency, .. } | WaveSpec::Table { frequency, .. } => {
                Some(*frequency)
            }
            WaveSpec::Constant(_) | WaveSpec::Ramp { .. } => None,
        }
    }

    /// Finite length of the spec, present only for ramps.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            WaveSpec::Ramp { duration, .. } => Some(*duration),
            _ => None,
        }
    }

    /// Lowest and highest value this wave can produce.
    pub fn bounds(&self) -> (f64, f64) {
        match self {
            WaveSpec::Constant(v) => (*v, *v),
            WaveSpec::Periodic { min, max, .. } => (*min, *max),
            WaveSpec::Ramp { start, end, .. } => (start.min(*end), start.max(*end)),
            WaveSpec::Table { values, .. } => values
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v))),
        }
    }

    /// Value `elapsed` after the generator's time origin.
    pub fn value_at(&self, elapsed: Duration) -> f64 {
        match self {
            WaveSpec::Constant(v) => *v,
            WaveSpec::Periodic { shape, min, max, frequency } => {
                shape.evaluate(phase_at(elapsed, *frequency), *min, *max)
            }
            WaveSpec::Ramp { start, end, duration } => ramp(*start, *end, *duration, elapsed),
            WaveSpec::Table { values, frequency } => table(values, phase_at(elapsed, *frequency)),
        }
    }

    pub fn is_complete_at(&self, elapsed: Duration) -> bool {
        self.duration().is_some_and(|duration| elapsed >= duration)
    }

    /// Shape-level checks that do not depend on the channel's range.
    pub fn check(&self) -> Result<(), Error> {
        let finite = |v: f64, what: &str| {
            if v.is_finite() {
                Ok(())
            } else {
                Err(Error::validation(format!("{} must be finite", what)))
            }
        };
        match self {
            WaveSpec::Constant(v) => finite(*v, "value"),
            WaveSpec::Periodic { min, max, frequency, .. } => {
                finite(*min, "minimum")?;
                finite(*max, "maximum")?;
                if min > max {
                    return Err(Error::validation(format!(
                        "minimum {} is above maximum {}",
                        min, max
                    )));
                }
                check_frequency(*frequency)
            }
            WaveSpec::Ramp { start, end, duration } => {
                finite(*start, "ramp start")?;
                finite(*end, "ramp end")?;
                if duration.is_zero() {
                    return Err(Error::validation("ramp duration must be greater than 0"));
                }
                Ok(())
            }
            WaveSpec::Table { values, frequency } => {
                if values.is_empty() {
                    return Err(Error::validation("table waveform needs at least one value"));
                }
                for v in values.iter() {
                    finite(*v, "table value")?;
                }
                check_frequency(*frequency)
            }
        }
    }
}

fn check_frequency(frequency: f64) -> Result<(), Error> {
    if frequency.is_finite() && frequency > 0.0 {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "frequency must be greater than 0 Hz (given: {})",
            frequency
        )))
    }
}

impl fmt::Display for WaveSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaveSpec::Constant(v) => write!(f, "constant {:.3}", v),
            WaveSpec::Periodic { shape, min, max, frequency } => {
                write!(f, "{} {:.3}..{:.3} @ {} Hz", shape, min, max, frequency)
            }
            WaveSpec::Ramp { start, end, duration } => {
                write!(f, "ramp {:.3} -> {:.3} in {:?}", start, end, duration)
            }
            WaveSpec::Table { values, frequency } => {
                write!(f, "table of {} values @ {} Hz", values.len(), frequency)
            }
        }
    }
}
