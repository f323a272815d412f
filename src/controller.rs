use std::sync::Arc;

use tokio::time::Duration;
use tracing::{error, info};

use crate::channel::ChannelSupervisor;
use crate::config::ControllerConfig;
use crate::error::Result;
use crate::relay::RelaySwitcher;
use crate::sink::{ChannelKind, DigitalSink, OutputSink};
use crate::waveform::{WaveShape, WaveSpec};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Status {
    pub voltage_running: bool,
    pub current_running: bool,
    pub relay_switching: bool,
    pub relay_frequency: f64,
    pub relay_pulsing: bool,
    pub relay_on: bool,
}

/// Control surface for the board: one supervisor per analog channel plus
/// the relay. Each output runs independently of the others.
pub struct OutputController {
    voltage: ChannelSupervisor,
    current: ChannelSupervisor,
    relay: RelaySwitcher,
}

impl OutputController {
    /// Builds the supervisors and parks every output at its safe default.
    pub async fn start(
        config: ControllerConfig,
        analog: Arc<dyn OutputSink>,
        digital: Arc<dyn DigitalSink>,
    ) -> Result<Self> {
        let controller = Self {
            voltage: ChannelSupervisor::new(
                config.voltage.clone(),
                analog.clone(),
                config.tick_interval,
                config.stop_timeout,
            ),
            current: ChannelSupervisor::new(
                config.current.clone(),
                analog,
                config.tick_interval,
                config.stop_timeout,
            ),
            relay: RelaySwitcher::new(config.relay.clone(), digital, config.stop_timeout),
        };
        controller.stop_all().await?;
        info!(
            "output controller ready, update rate {} Hz",
            1.0 / config.tick_interval.as_secs_f64()
        );
        Ok(controller)
    }

    pub fn channel(&self, kind: ChannelKind) -> &ChannelSupervisor {
        match kind {
            ChannelKind::Voltage => &self.voltage,
            ChannelKind::Current => &self.current,
        }
    }

    pub fn relay(&self) -> &RelaySwitcher {
        &self.relay
    }

    pub async fn set_constant_voltage(&self, volts: f64) -> Result<()> {
        self.voltage.set_constant(volts).await
    }

    pub async fn start_voltage_wave(&self, shape: WaveShape, min: f64, max: f64, frequency: f64) -> Result<()> {
        self.voltage.start_wave(shape, min, max, frequency).await
    }

    pub async fn start_voltage_ramp(&self, start: f64, end: f64, duration: Duration) -> Result<()> {
        self.voltage.start_ramp(start, end, duration).await
    }

    pub async fn stop_voltage(&self) -> Result<()> {
        self.voltage.stop().await
    }

    pub async fn set_constant_current(&self, milliamps: f64) -> Result<()> {
        self.current.set_constant(milliamps).await
    }

    pub async fn start_current_wave(&self, shape: WaveShape, min: f64, max: f64, frequency: f64) -> Result<()> {
        self.current.start_wave(shape, min, max, frequency).await
    }

    pub async fn start_current_ramp(&self, start: f64, end: f64, duration: Duration) -> Result<()> {
        self.current.start_ramp(start, end, duration).await
    }

    pub async fn stop_current(&self) -> Result<()> {
        self.current.stop().await
    }

    pub async fn apply(&self, kind: ChannelKind, spec: WaveSpec) -> Result<()> {
        self.channel(kind).apply(spec).await
    }

    pub async fn start_relay_switching(&self, frequency: f64) -> Result<()> {
        self.relay.start_switching(frequency).await
    }

    pub async fn set_relay(&self, on: bool) -> Result<()> {
        self.relay.set_constant(on).await
    }

    pub async fn pulse_relay(&self, duration: Duration) -> Result<()> {
        self.relay.pulse(duration).await
    }

    pub async fn stop_relay(&self) -> Result<()> {
        self.relay.stop().await
    }

    pub fn status(&self) -> Status {
        let relay = self.relay.state();
        Status {
            voltage_running: self.voltage.is_running(),
            current_running: self.current.is_running(),
            relay_switching: relay.switching,
            relay_frequency: relay.frequency,
            relay_pulsing: relay.pulsing,
            relay_on: relay.state,
        }
    }

    /// Stops all three outputs. Every output is attempted; the first error
    /// is returned.
    pub async fn stop_all(&self) -> Result<()> {
        let (voltage, current, relay) =
            tokio::join!(self.voltage.stop(), self.current.stop(), self.relay.stop());
        voltage.and(current).and(relay)
    }

    /// Parks every output at its safe default, including faulted ones.
    pub async fn shutdown(&self) -> Result<()> {
        let (voltage, current, relay) = tokio::join!(
            self.voltage.shutdown(),
            self.current.shutdown(),
            self.relay.shutdown()
        );
        let result = voltage.and(current).and(relay);
        match &result {
            Ok(()) => info!("all outputs parked"),
            Err(e) => error!("shutdown incomplete: {}", e),
        }
        result
    }
}
