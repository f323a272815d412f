use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as StateLock;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::config::RelayConfig;
use crate::error::{Error, Result, SinkError};
use crate::generator::{blocking_write, GeneratorHost, GeneratorTask, Program, Pulse, TaskId, Toggle, WriteGate};
use crate::sink::DigitalSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    Idle,
    Switching,
    Pulsing,
    ConstantOn,
    ConstantOff,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayState {
    pub switching: bool,
    /// Switching frequency in Hz, 0 when not switching.
    pub frequency: f64,
    pub pulsing: bool,
    /// Level last written to the relay.
    pub state: bool,
    pub last_error: Option<SinkError>,
    pub write_failures: u64,
    pub faulted: bool,
    held: bool,
    task: Option<TaskId>,
}

impl RelayState {
    pub fn mode(&self) -> RelayMode {
        match (self.switching, self.pulsing, self.held, self.state) {
            (true, _, _, _) => RelayMode::Switching,
            (false, true, _, _) => RelayMode::Pulsing,
            (false, false, true, true) => RelayMode::ConstantOn,
            (false, false, true, false) => RelayMode::ConstantOff,
            (false, false, false, _) => RelayMode::Idle,
        }
    }
}

struct RelayShared {
    sink: Arc<dyn DigitalSink>,
    gate: WriteGate,
    state: StateLock<RelayState>,
}

impl RelayShared {
    fn drive(&self, high: bool) -> Result<(), SinkError> {
        self.sink.set_state(high)?;
        self.state.lock().state = high;
        Ok(())
    }

    fn record_failure(&self, error: SinkError) {
        let mut state = self.state.lock();
        state.last_error = Some(error);
        state.write_failures += 1;
    }
}

impl GeneratorHost for RelayShared {
    type Output = bool;

    fn write(&self, id: TaskId, high: bool) -> Result<(), SinkError> {
        self.gate.write_as(id, || self.drive(high))
    }

    fn write_failed(&self, _id: TaskId, error: SinkError) {
        self.record_failure(error);
    }

    fn completed(&self, id: TaskId) {
        let mut state = self.state.lock();
        if state.task == Some(id) {
            state.task = None;
            state.pulsing = false;
            info!("relay pulse finished, off");
        }
    }
}

/// Square-wave switching of the relay output at 50% duty, plus single
/// pulses. Shares the generator lifecycle of the analog channels: every
/// request waits for the previous relay task to exit.
pub struct RelaySwitcher {
    config: RelayConfig,
    stop_timeout: Duration,
    shared: Arc<RelayShared>,
    ops: Mutex<Option<GeneratorTask>>,
    next_id: AtomicU64,
}

impl RelaySwitcher {
    pub fn new(config: RelayConfig, sink: Arc<dyn DigitalSink>, stop_timeout: Duration) -> Self {
        Self {
            config,
            stop_timeout,
            shared: Arc::new(RelayShared {
                sink,
                gate: WriteGate::default(),
                state: StateLock::new(RelayState::default()),
            }),
            ops: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> RelayState {
        self.shared.state.lock().clone()
    }

    pub fn mode(&self) -> RelayMode {
        self.shared.state.lock().mode()
    }

    pub fn is_switching(&self) -> bool {
        self.shared.state.lock().switching
    }

    /// Toggles the relay, each level held for `0.5 / frequency` seconds.
    /// A stop request interrupts the half-period wait immediately.
    pub async fn start_switching(&self, frequency: f64) -> Result<()> {
        let mut current = self.ops.lock().await;
        self.ensure_healthy()?;
        if let Err(e) = self.config.check_frequency(frequency) {
            warn!("relay request rejected: {}", e);
            return Err(e);
        }
        self.halt(&mut current).await?;

        let half_period = Duration::from_secs_f64(0.5 / frequency);
        self.launch(&mut current, Toggle::default(), half_period, |state| {
            state.switching = true;
            state.frequency = frequency;
        })
        .await?;
        info!("relay switching at {} Hz", frequency);
        Ok(())
    }

    /// Stops switching and holds the relay at `high`.
    pub async fn set_constant(&self, high: bool) -> Result<()> {
        let mut current = self.ops.lock().await;
        self.ensure_healthy()?;
        self.halt(&mut current).await?;
        self.write_direct(high).await?;
        self.shared.state.lock().held = true;
        info!("relay held {}", if high { "on" } else { "off" });
        Ok(())
    }

    /// Drives the relay high and returns; it drops low after `duration`
    /// unless a later request replaces the pulse. Rejected while switching.
    pub async fn pulse(&self, duration: Duration) -> Result<()> {
        let mut current = self.ops.lock().await;
        self.ensure_healthy()?;
        if self.is_switching() {
            warn!("relay pulse rejected while switching");
            return Err(Error::validation("cannot pulse the relay while it is switching"));
        }
        if let Err(e) = self.config.check_pulse(duration) {
            warn!("relay pulse rejected: {}", e);
            return Err(e);
        }
        self.halt(&mut current).await?;

        self.launch(&mut current, Pulse::default(), duration, |state| state.pulsing = true)
            .await?;
        info!("relay pulse of {:?} started", duration);
        Ok(())
    }

    /// Stops switching or a pulse and turns the relay off (also when idle).
    pub async fn stop(&self) -> Result<()> {
        let mut current = self.ops.lock().await;
        self.ensure_healthy()?;
        self.halt(&mut current).await?;
        self.park().await
    }

    /// Turns the relay off even when faulted.
    pub async fn shutdown(&self) -> Result<()> {
        let mut current = self.ops.lock().await;
        let halted = self.halt(&mut current).await;
        let parked = self.park().await;
        halted.and(parked)
    }

    async fn launch<P>(
        &self,
        current: &mut Option<GeneratorTask>,
        program: P,
        period: Duration,
        mark: impl FnOnce(&mut RelayState),
    ) -> Result<()>
    where
        P: Program<Output = bool>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.shared.state.lock();
            state.held = false;
            state.task = Some(id);
            mark(&mut *state);
        }
        self.shared.gate.grant(id);
        match GeneratorTask::start(id, program, self.shared.clone(), period, self.stop_timeout).await {
            Ok(task) => {
                *current = Some(task);
                Ok(())
            }
            Err(e) => {
                let mut state = self.shared.state.lock();
                state.switching = false;
                state.pulsing = false;
                state.frequency = 0.0;
                state.task = None;
                state.faulted = true;
                Err(e)
            }
        }
    }

    async fn park(&self) -> Result<()> {
        self.write_direct(false).await?;
        self.shared.state.lock().held = false;
        info!("relay stopped, off");
        Ok(())
    }

    fn ensure_healthy(&self) -> Result<()> {
        if self.shared.state.lock().faulted {
            return Err(Error::Consistency(
                "relay switcher is faulted and refuses further requests".into(),
            ));
        }
        Ok(())
    }

    async fn halt(&self, current: &mut Option<GeneratorTask>) -> Result<()> {
        let Some(task) = current.take() else {
            return Ok(());
        };
        let id = task.id();
        let stopped = task.stop(self.stop_timeout).await;
        let mut state = self.shared.state.lock();
        state.switching = false;
        state.pulsing = false;
        state.frequency = 0.0;
        state.task = None;
        if let Err(e) = stopped {
            error!("relay task {} failed to stop: {}", id, e);
            state.faulted = true;
            return Err(e);
        }
        Ok(())
    }

    async fn write_direct(&self, high: bool) -> Result<()> {
        let shared = self.shared.clone();
        let result = blocking_write(self.stop_timeout, move || shared.gate.reclaim(|| shared.drive(high))).await;
        match &result {
            Ok(()) => {}
            Err(Error::Sink(e)) => {
                warn!("relay write failed: {}", e);
                self.shared.record_failure(e.clone());
            }
            Err(e) => {
                error!("relay write failed: {}", e);
                self.shared.state.lock().faulted = true;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedBoard;
    use tracing_subscriber::EnvFilter;

    fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    }

    fn relay(board: &Arc<SimulatedBoard>) -> RelaySwitcher {
        RelaySwitcher::new(RelayConfig::default(), board.clone(), Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_toggles_each_half_period() {
        init_test_logging();
        let board = Arc::new(SimulatedBoard::new());
        let relay = relay(&board);

        relay.start_switching(10.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(175)).await;
        assert_eq!(board.relay_levels(), vec![true, false, true, false]);

        let state = relay.state();
        assert!(state.switching);
        assert_eq!(state.frequency, 10.0);
        assert_eq!(relay.mode(), RelayMode::Switching);

        relay.stop().await.unwrap();
        assert_eq!(board.relay_levels().last(), Some(&false));
        assert_eq!(relay.mode(), RelayMode::Idle);
        assert_eq!(relay.state().frequency, 0.0);
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_for_half_period() {
        init_test_logging();
        let board = Arc::new(SimulatedBoard::new());
        let relay = relay(&board);

        relay.start_switching(1.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        relay.stop().await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_millis(50));
        assert_eq!(board.relay_levels(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_lowest_frequency_still_stops_promptly() {
        let board = Arc::new(SimulatedBoard::new());
        let relay = relay(&board);
        relay.start_switching(0.01).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        relay.stop().await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_frequency_out_of_bounds_is_rejected() {
        let board = Arc::new(SimulatedBoard::new());
        let relay = relay(&board);
        assert!(matches!(relay.start_switching(0.005).await, Err(Error::Validation(_))));
        assert!(matches!(relay.start_switching(61.0).await, Err(Error::Validation(_))));
        assert!(matches!(relay.start_switching(f64::NAN).await, Err(Error::Validation(_))));
        assert!(board.relay_levels().is_empty());
        assert_eq!(relay.mode(), RelayMode::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_constant_stops_switching() {
        let board = Arc::new(SimulatedBoard::new());
        let relay = relay(&board);
        relay.start_switching(5.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        relay.set_constant(true).await.unwrap();
        let state = relay.state();
        assert!(!state.switching);
        assert!(state.state);
        assert_eq!(relay.mode(), RelayMode::ConstantOn);

        let count = board.relay_levels().len();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(board.relay_levels().len(), count);
        assert_eq!(board.relay_levels().last(), Some(&true));

        relay.set_constant(false).await.unwrap();
        assert_eq!(relay.mode(), RelayMode::ConstantOff);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulse_returns_while_high() {
        let board = Arc::new(SimulatedBoard::new());
        let relay = relay(&board);

        relay.pulse(Duration::from_millis(100)).await.unwrap();
        assert_eq!(board.relay_levels(), vec![true]);
        assert_eq!(relay.mode(), RelayMode::Pulsing);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let events = board.events();
        assert_eq!(board.relay_levels(), vec![true, false]);
        assert!(events[1].at - events[0].at >= Duration::from_millis(100));
        assert!(!relay.state().state);
        assert_eq!(relay.mode(), RelayMode::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cuts_a_pulse_short() {
        let board = Arc::new(SimulatedBoard::new());
        let relay = relay(&board);
        relay.pulse(Duration::from_secs(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        relay.stop().await.unwrap();
        assert_eq!(board.relay_levels(), vec![true, false]);
        assert_eq!(relay.mode(), RelayMode::Idle);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(board.relay_levels(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulse_rejected_while_switching() {
        let board = Arc::new(SimulatedBoard::new());
        let relay = relay(&board);
        relay.start_switching(2.0).await.unwrap();

        assert!(matches!(relay.pulse(Duration::from_millis(100)).await, Err(Error::Validation(_))));
        assert!(relay.is_switching());
        assert!(relay.pulse(Duration::ZERO).await.is_err());
        relay.stop().await.unwrap();
        assert!(relay.pulse(Duration::from_secs(11)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_survives_write_errors() {
        let board = Arc::new(SimulatedBoard::new());
        let relay = relay(&board);
        board.fail_next(1);
        relay.start_switching(10.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let state = relay.state();
        assert!(state.switching);
        assert_eq!(state.write_failures, 1);
        // the first (high) write was lost
        assert_eq!(board.relay_levels(), vec![false, true]);
        relay.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_idle_turns_off() {
        let board = Arc::new(SimulatedBoard::new());
        let relay = relay(&board);
        relay.stop().await.unwrap();
        assert_eq!(board.relay_levels(), vec![false]);
    }
}
