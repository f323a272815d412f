use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as StateLock;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::config::ChannelConfig;
use crate::error::{Error, Result, SinkError};
use crate::generator::{blocking_write, GeneratorHost, GeneratorTask, TaskId, WriteGate};
use crate::sink::{ChannelKind, OutputSink};
use crate::waveform::{WaveShape, WaveSpec};

/// Snapshot of one channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelState {
    pub running: bool,
    /// Last request applied. Stays set after a ramp completes (the
    /// channel holds the ramp's end value) and clears on `stop`.
    pub active: Option<WaveSpec>,
    pub last_error: Option<SinkError>,
    pub write_failures: u64,
    /// Set after a stop timed out; every request is refused from then on.
    pub faulted: bool,
    task: Option<TaskId>,
}

struct ChannelShared {
    kind: ChannelKind,
    sink: Arc<dyn OutputSink>,
    gate: WriteGate,
    state: StateLock<ChannelState>,
}

impl ChannelShared {
    fn record_failure(&self, error: SinkError) {
        let mut state = self.state.lock();
        state.last_error = Some(error);
        state.write_failures += 1;
    }
}

impl GeneratorHost for ChannelShared {
    type Output = f64;

    fn write(&self, id: TaskId, value: f64) -> Result<(), SinkError> {
        self.gate.write_as(id, || self.kind.write(self.sink.as_ref(), value))
    }

    fn write_failed(&self, _id: TaskId, error: SinkError) {
        self.record_failure(error);
    }

    fn completed(&self, id: TaskId) {
        let mut state = self.state.lock();
        // A concurrent stop may already have replaced this task.
        if state.task == Some(id) {
            state.task = None;
            state.running = false;
            info!("{} ramp finished, holding end value", self.kind);
        }
    }
}

/// Owns the one generator allowed to drive a channel. Every request goes
/// through `ops`, so a replacement always waits for the previous
/// generator's exit before anything new reaches the sink.
pub struct ChannelSupervisor {
    config: ChannelConfig,
    tick_interval: Duration,
    stop_timeout: Duration,
    shared: Arc<ChannelShared>,
    ops: Mutex<Option<GeneratorTask>>,
    next_id: AtomicU64,
}

impl ChannelSupervisor {
    pub fn new(
        config: ChannelConfig,
        sink: Arc<dyn OutputSink>,
        tick_interval: Duration,
        stop_timeout: Duration,
    ) -> Self {
        let shared = Arc::new(ChannelShared {
            kind: config.kind,
            sink,
            gate: WriteGate::default(),
            state: StateLock::new(ChannelState::default()),
        });
        Self {
            config,
            tick_interval,
            stop_timeout,
            shared,
            ops: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.config.kind
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Highest periodic frequency this channel samples without aliasing.
    pub fn nyquist(&self) -> f64 {
        0.5 / self.tick_interval.as_secs_f64()
    }

    /// Stops any generator and writes `value` once.
    pub async fn set_constant(&self, value: f64) -> Result<()> {
        self.apply(WaveSpec::Constant(value)).await
    }

    pub async fn start_wave(&self, shape: WaveShape, min: f64, max: f64, frequency: f64) -> Result<()> {
        self.apply(WaveSpec::periodic(shape, min, max, frequency)).await
    }

    /// The generator ends by itself after `duration` and the channel keeps
    /// the end value.
    pub async fn start_ramp(&self, start: f64, end: f64, duration: Duration) -> Result<()> {
        self.apply(WaveSpec::ramp(start, end, duration)).await
    }

    pub async fn start_table(&self, values: Vec<f64>, frequency: f64) -> Result<()> {
        self.apply(WaveSpec::table(values, frequency)).await
    }

    /// Validates `spec`, stops the current generator, then applies `spec`.
    /// A rejected request leaves the channel exactly as it was.
    pub async fn apply(&self, spec: WaveSpec) -> Result<()> {
        let mut current = self.ops.lock().await;
        self.ensure_healthy()?;
        if let Err(e) = self.config.check_spec(&spec) {
            warn!("{} request {} rejected: {}", self.kind(), spec, e);
            return Err(e);
        }
        if let Some(frequency) = spec.frequency() {
            let nyquist = self.nyquist();
            if frequency > nyquist {
                warn!(
                    "{} frequency {} Hz is above {} Hz and will alias at this update rate",
                    self.kind(),
                    frequency,
                    nyquist
                );
            }
        }
        self.halt(&mut current).await?;

        if let WaveSpec::Constant(value) = spec {
            if let Err(e) = self.write_direct(value).await {
                // the previous generator is gone either way
                self.shared.state.lock().active = None;
                return Err(e);
            }
            self.shared.state.lock().active = Some(spec);
            info!("{} set to {} {}", self.kind(), value, self.kind().unit());
            return Ok(());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Publish before spawning so a very short ramp's completion matches.
        {
            let mut state = self.shared.state.lock();
            state.running = true;
            state.active = Some(spec.clone());
            state.task = Some(id);
        }
        // Nothing is in flight here: the previous generator has exited.
        self.shared.gate.grant(id);
        info!("{} generator {} started: {}", self.kind(), id, spec);
        match GeneratorTask::start(id, spec, self.shared.clone(), self.tick_interval, self.stop_timeout).await {
            Ok(task) => {
                *current = Some(task);
                Ok(())
            }
            Err(e) => {
                let mut state = self.shared.state.lock();
                state.running = false;
                state.task = None;
                state.faulted = true;
                Err(e)
            }
        }
    }

    /// Stops any generator and writes the safe default (also when idle).
    pub async fn stop(&self) -> Result<()> {
        let mut current = self.ops.lock().await;
        self.ensure_healthy()?;
        self.halt(&mut current).await?;
        self.park().await
    }

    /// Drives the channel to its safe default even when faulted. A write
    /// left running by a timed-out generator lands before the default.
    pub async fn shutdown(&self) -> Result<()> {
        let mut current = self.ops.lock().await;
        let halted = self.halt(&mut current).await;
        let parked = self.park().await;
        halted.and(parked)
    }

    async fn park(&self) -> Result<()> {
        self.shared.state.lock().active = None;
        self.write_direct(self.config.safe_default).await?;
        info!(
            "{} stopped, parked at {} {}",
            self.kind(),
            self.config.safe_default,
            self.kind().unit()
        );
        Ok(())
    }

    fn ensure_healthy(&self) -> Result<()> {
        if self.shared.state.lock().faulted {
            return Err(Error::Consistency(format!(
                "{} supervisor is faulted and refuses further requests",
                self.kind()
            )));
        }
        Ok(())
    }

    /// Cancels the current generator and waits for it to exit.
    async fn halt(&self, current: &mut Option<GeneratorTask>) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
            state.task = None;
        }
        let Some(task) = current.take() else {
            return Ok(());
        };
        let id = task.id();
        if let Err(e) = task.stop(self.stop_timeout).await {
            error!("{} generator {} failed to stop: {}", self.kind(), id, e);
            self.shared.state.lock().faulted = true;
            return Err(e);
        }
        Ok(())
    }

    /// Takes the sink back from any generator and writes `value`.
    async fn write_direct(&self, value: f64) -> Result<()> {
        let shared = self.shared.clone();
        let result = blocking_write(self.stop_timeout, move || {
            shared.gate.reclaim(|| shared.kind.write(shared.sink.as_ref(), value))
        })
        .await;
        match &result {
            Ok(()) => {}
            Err(Error::Sink(e)) => {
                warn!("{} write of {} failed: {}", self.kind(), value, e);
                self.shared.record_failure(e.clone());
            }
            Err(e) => {
                error!("{} write of {} failed: {}", self.kind(), value, e);
                self.shared.state.lock().faulted = true;
            }
        }
        result
    }
}
