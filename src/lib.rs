mod channel;
mod config;
mod control_interface;
mod controller;
mod error;
mod generator;
mod phase;
mod relay;
mod sim;
mod sink;
pub mod waveform;

pub use channel::{ChannelState, ChannelSupervisor};
pub use config::{ChannelConfig, ControllerConfig, RelayConfig};
pub use control_interface::control_interface;
pub use controller::{OutputController, Status};
pub use error::{Error, Result, SinkError};
pub use generator::{GeneratorHost, GeneratorTask, Program, Pulse, Step, TaskId, Toggle, WriteGate};
pub use phase::{phase_at, PhaseClock};
pub use relay::{RelayMode, RelayState, RelaySwitcher};
pub use sim::{SimulatedBoard, SinkEvent, SinkWrite};
pub use sink::{ChannelKind, DigitalSink, OutputSink};
pub use waveform::{WaveShape, WaveSpec};

use tokio::time::Duration;

#[derive(Debug, Clone)]
pub enum ControlCommand {
    SetConstant(ChannelKind, f64),
    StartWave {
        channel: ChannelKind,
        shape: WaveShape,
        min: f64,
        max: f64,
        frequency: f64,
    },
    StartRamp {
        channel: ChannelKind,
        start: f64,
        end: f64,
        duration: Duration,
    },
    StartTable {
        channel: ChannelKind,
        values: Vec<f64>,
        frequency: f64,
    },
    Stop(ChannelKind),
    StartRelaySwitching(f64),
    SetRelay(bool),
    PulseRelay(Duration),
    StopRelay,
    StopAll,
}
