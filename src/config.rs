use anyhow::{anyhow, Result};
use tokio::time::Duration;
use tracing::error;

use crate::error::Error;
use crate::sink::ChannelKind;
use crate::waveform::WaveSpec;

/// Declared physical range of one analog channel and the value it is
/// driven to whenever its generator stops.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub min: f64,
    pub max: f64,
    pub safe_default: f64,
}

impl ChannelConfig {
    pub fn new(kind: ChannelKind, min: f64, max: f64, safe_default: f64) -> Result<Self> {
        if !min.is_finite() || !max.is_finite() || !safe_default.is_finite() {
            error!("{} channel limits must be finite", kind);
            return Err(anyhow!("{} channel limits must be finite", kind));
        }
        if min >= max {
            error!("{} channel minimum must be below maximum", kind);
            return Err(anyhow!("{} channel minimum {} must be below maximum {}", kind, min, max));
        }
        if safe_default < min || safe_default > max {
            error!("{} safe default outside channel range", kind);
            return Err(anyhow!(
                "{} safe default {} outside [{}, {}]",
                kind,
                safe_default,
                min,
                max
            ));
        }
        Ok(Self {
            kind,
            min,
            max,
            safe_default,
        })
    }

    /// 0 - 3.3 V, parked at 0 V.
    pub fn voltage() -> Self {
        Self {
            kind: ChannelKind::Voltage,
            min: 0.0,
            max: 3.3,
            safe_default: 0.0,
        }
    }

    /// 4 - 20 mA loop, parked at the loop minimum.
    pub fn current() -> Self {
        Self {
            kind: ChannelKind::Current,
            min: 4.0,
            max: 20.0,
            safe_default: 4.0,
        }
    }

    pub fn check_value(&self, value: f64) -> Result<(), Error> {
        if value.is_finite() && value >= self.min && value <= self.max {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "{} {} {} outside [{}, {}] {}",
                self.kind,
                value,
                self.kind.unit(),
                self.min,
                self.max,
                self.kind.unit()
            )))
        }
    }

    /// Every value the wave can produce must be inside the channel range.
    pub fn check_spec(&self, spec: &WaveSpec) -> Result<(), Error> {
        spec.check()?;
        let (lo, hi) = spec.bounds();
        self.check_value(lo)?;
        self.check_value(hi)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub min_frequency: f64,
    pub max_frequency: f64,
    pub max_pulse: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            min_frequency: 0.01,
            max_frequency: 60.0,
            max_pulse: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    pub fn check_frequency(&self, frequency: f64) -> Result<(), Error> {
        if frequency.is_finite() && frequency >= self.min_frequency && frequency <= self.max_frequency {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "relay frequency must be between {} and {} Hz (given: {})",
                self.min_frequency, self.max_frequency, frequency
            )))
        }
    }

    pub fn check_pulse(&self, duration: Duration) -> Result<(), Error> {
        if duration.is_zero() || duration > self.max_pulse {
            return Err(Error::validation(format!(
                "pulse duration must be in (0, {:?}] (given: {:?})",
                self.max_pulse, duration
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub voltage: ChannelConfig,
    pub current: ChannelConfig,
    pub relay: RelayConfig,
    /// Generator update period (10 ms = 100 Hz).
    pub tick_interval: Duration,
    /// Upper bound for a generator to acknowledge a stop.
    pub stop_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            voltage: ChannelConfig::voltage(),
            current: ChannelConfig::current(),
            relay: RelayConfig::default(),
            tick_interval: Duration::from_millis(10),
            stop_timeout: Duration::from_secs(1),
        }
    }
}

impl ControllerConfig {
    pub fn new(
        voltage: ChannelConfig,
        current: ChannelConfig,
        relay: RelayConfig,
        tick_interval: Duration,
        stop_timeout: Duration,
    ) -> Result<Self> {
        if voltage.kind != ChannelKind::Voltage || current.kind != ChannelKind::Current {
            error!("channel configs passed in the wrong slots");
            return Err(anyhow!("channel configs passed in the wrong slots"));
        }
        if tick_interval.is_zero() {
            error!("tick_interval must be greater than 0");
            return Err(anyhow!("tick_interval must be greater than 0"));
        }
        if stop_timeout <= tick_interval {
            error!("stop_timeout must be longer than tick_interval");
            return Err(anyhow!("stop_timeout must be longer than tick_interval"));
        }
        if relay.min_frequency <= 0.0 || relay.min_frequency > relay.max_frequency {
            error!("relay frequency bounds are invalid");
            return Err(anyhow!(
                "relay frequency bounds [{}, {}] are invalid",
                relay.min_frequency,
                relay.max_frequency
            ));
        }
        Ok(Self {
            voltage,
            current,
            relay,
            tick_interval,
            stop_timeout,
        })
    }
}
