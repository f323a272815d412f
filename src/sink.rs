use std::fmt;

use crate::error::SinkError;

/// Hardware side of the analog outputs. One call writes one value; there
/// is no buffering and no back-pressure. Implementations must tolerate
/// the voltage and current channel being driven from different tasks,
/// but a single channel is only ever written by one task at a time.
pub trait OutputSink: Send + Sync {
    /// Physical voltage in volts.
    fn write_voltage(&self, value: f64) -> Result<(), SinkError>;
    /// Current-loop value in milliamps.
    fn write_current(&self, value: f64) -> Result<(), SinkError>;
}

/// Binary output such as the relay GPIO.
pub trait DigitalSink: Send + Sync {
    fn set_state(&self, high: bool) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Voltage,
    Current,
}

impl ChannelKind {
    pub fn unit(self) -> &'static str {
        match self {
            ChannelKind::Voltage => "V",
            ChannelKind::Current => "mA",
        }
    }

    pub(crate) fn write(self, sink: &dyn OutputSink, value: f64) -> Result<(), SinkError> {
        match self {
            ChannelKind::Voltage => sink.write_voltage(value),
            ChannelKind::Current => sink.write_current(value),
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Voltage => f.write_str("voltage"),
            ChannelKind::Current => f.write_str("current"),
        }
    }
}
