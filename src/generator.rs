use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::{spawn_blocking, JoinHandle};
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::error::{Error, Result, SinkError};
use crate::phase::PhaseClock;
use crate::waveform::WaveSpec;

pub type TaskId = u64;

pub enum Step<T> {
    Continue(T),
    /// Write this value, then exit.
    Last(T),
}

/// Produces the value to write on each tick.
pub trait Program: Send + 'static {
    type Output: Copy + Debug + Send + 'static;

    fn next(&mut self, clock: &PhaseClock) -> Step<Self::Output>;
}

impl Program for WaveSpec {
    type Output = f64;

    fn next(&mut self, clock: &PhaseClock) -> Step<f64> {
        let elapsed = clock.elapsed();
        let value = self.value_at(elapsed);
        if self.is_complete_at(elapsed) {
            Step::Last(value)
        } else {
            Step::Continue(value)
        }
    }
}

/// Alternates high/low on every tick, starting high.
#[derive(Debug)]
pub struct Toggle {
    level: bool,
}

impl Default for Toggle {
    fn default() -> Self {
        Self { level: true }
    }
}

impl Program for Toggle {
    type Output = bool;

    fn next(&mut self, _clock: &PhaseClock) -> Step<bool> {
        let level = self.level;
        self.level = !level;
        Step::Continue(level)
    }
}

/// High on the first tick, low on the second, then done. Run it with the
/// pulse width as the tick period.
#[derive(Debug, Default)]
pub struct Pulse {
    fired: bool,
}

impl Program for Pulse {
    type Output = bool;

    fn next(&mut self, _clock: &PhaseClock) -> Step<bool> {
        if self.fired {
            Step::Last(false)
        } else {
            self.fired = true;
            Step::Continue(true)
        }
    }
}

/// The owner a generator reports to.
pub trait GeneratorHost: Send + Sync + 'static {
    type Output;

    /// Blocking sink write on behalf of generator `id`. Runs on the
    /// blocking pool, never on a runtime worker.
    fn write(&self, id: TaskId, value: Self::Output) -> Result<(), SinkError>;

    /// A tick's write failed; the generator keeps running.
    fn write_failed(&self, id: TaskId, error: SinkError);

    /// The program returned `Step::Last` and the task is exiting on its own.
    fn completed(&self, _id: TaskId) {}
}

/// Names the generator allowed to write to one output. Every sink write,
/// from a generator or from the supervisor, happens while holding it, so
/// a write left running by a stop timeout always lands before the
/// supervisor's next value.
#[derive(Debug, Default)]
pub struct WriteGate {
    owner: Mutex<Option<TaskId>>,
}

impl WriteGate {
    /// Hands the sink to generator `id`. No write may be in flight.
    pub fn grant(&self, id: TaskId) {
        *self.owner.lock() = Some(id);
    }

    /// Runs `write` if `id` still owns the sink. A revoked write is skipped.
    pub fn write_as(&self, id: TaskId, write: impl FnOnce() -> Result<(), SinkError>) -> Result<(), SinkError> {
        let owner = self.owner.lock();
        if *owner != Some(id) {
            debug!("generator {} no longer owns the sink, write skipped", id);
            return Ok(());
        }
        write()
    }

    /// Takes the sink back from any generator, then runs `write`. Waits
    /// for an in-flight generator write first.
    pub fn reclaim<T>(&self, write: impl FnOnce() -> T) -> T {
        let mut owner = self.owner.lock();
        *owner = None;
        write()
    }
}

/// Runs a supervisor-side write on the blocking pool and waits up to
/// `limit` for it. A write still running at the deadline is an
/// `Error::Consistency`; it lands later, in order, behind the gate.
pub(crate) async fn blocking_write<F>(limit: Duration, write: F) -> Result<()>
where
    F: FnOnce() -> Result<(), SinkError> + Send + 'static,
{
    match timeout(limit, spawn_blocking(write)).await {
        Ok(Ok(result)) => result.map_err(Error::from),
        Ok(Err(e)) => Err(Error::Consistency(format!("sink write aborted: {}", e))),
        Err(_) => Err(Error::Consistency(format!(
            "sink write did not finish within {:?}",
            limit
        ))),
    }
}

/// Handle to one running generator. Dropping it cancels the task without
/// waiting; `stop` cancels and waits for the exit.
#[derive(Debug)]
pub struct GeneratorTask {
    id: TaskId,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl GeneratorTask {
    /// Spawns the task and returns once its first tick has been written,
    /// waiting at most `limit` for that. The phase clock starts at that
    /// first tick.
    pub async fn start<P, H>(
        id: TaskId,
        program: P,
        host: Arc<H>,
        period: Duration,
        limit: Duration,
    ) -> Result<Self>
    where
        P: Program,
        H: GeneratorHost<Output = P::Output>,
    {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(run(id, program, host, period, cancel_rx, ready_tx));
        match timeout(limit, ready_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                error!("generator {} exited before it was scheduled", id);
                return Err(Error::Consistency(format!("generator {} failed to start", id)));
            }
            Err(_) => {
                handle.abort();
                error!("generator {} first write did not finish within {:?}", id, limit);
                return Err(Error::Consistency(format!(
                    "generator {} did not start within {:?}",
                    id, limit
                )));
            }
        }
        debug!("generator {} scheduled, period {:?}", id, period);
        Ok(Self {
            id,
            cancel: cancel_tx,
            handle,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Signals cancellation and waits up to `limit` for the task to exit.
    /// Once this returns `Ok` the task will never write again.
    pub async fn stop(mut self, limit: Duration) -> Result<()> {
        // Fails only if the task already exited and dropped its receiver.
        let _ = self.cancel.send(true);
        match timeout(limit, &mut self.handle).await {
            Ok(Ok(())) => {
                debug!("generator {} stopped", self.id);
                Ok(())
            }
            Ok(Err(e)) => {
                // A panicked task is gone as well, nothing can write any more.
                error!("generator {} ended abnormally: {}", self.id, e);
                Ok(())
            }
            Err(_) => {
                self.handle.abort();
                error!("generator {} did not stop within {:?}", self.id, limit);
                Err(Error::Consistency(format!(
                    "generator {} did not stop within {:?}",
                    self.id, limit
                )))
            }
        }
    }
}

async fn run<P, H>(
    id: TaskId,
    mut program: P,
    host: Arc<H>,
    period: Duration,
    mut cancel: watch::Receiver<bool>,
    ready: oneshot::Sender<()>,
) where
    P: Program,
    H: GeneratorHost<Output = P::Output>,
{
    let mut clock = PhaseClock::new();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ready = Some(ready);

    loop {
        tokio::select! {
            biased;
            // Either a stop request or the handle was dropped.
            _ = cancel.changed() => break,
            _ = ticker.tick() => {
                if ready.is_some() {
                    // phase 0 is the first tick
                    clock.reset();
                }
                let (value, last) = match program.next(&clock) {
                    Step::Continue(value) => (value, false),
                    Step::Last(value) => (value, true),
                };
                let writer = host.clone();
                match spawn_blocking(move || writer.write(id, value)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("generator {}: write of {:?} failed: {}", id, value, e);
                        host.write_failed(id, e);
                    }
                    Err(e) => error!("generator {}: write of {:?} aborted: {}", id, value, e),
                }
                if let Some(ready) = ready.take() {
                    let _ = ready.send(());
                }
                if last {
                    host.completed(id);
                    break;
                }
            }
        }
    }
    debug!("generator {} exited", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::WaveShape;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_subscriber::EnvFilter;

    fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    }

    const LIMIT: Duration = Duration::from_secs(1);

    #[derive(Default)]
    struct TestHost {
        written: Mutex<Vec<f64>>,
        attempts: AtomicUsize,
        fail_first: usize,
        failures: Mutex<Vec<TaskId>>,
        completed: Mutex<Option<TaskId>>,
        block_for: Option<std::time::Duration>,
    }

    impl GeneratorHost for TestHost {
        type Output = f64;

        fn write(&self, _id: TaskId, value: f64) -> Result<(), SinkError> {
            if let Some(block) = self.block_for {
                std::thread::sleep(block);
            }
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                return Err(SinkError::Bus("nack".into()));
            }
            self.written.lock().push(value);
            Ok(())
        }

        fn write_failed(&self, id: TaskId, _error: SinkError) {
            self.failures.lock().push(id);
        }

        fn completed(&self, id: TaskId) {
            *self.completed.lock() = Some(id);
        }
    }

    fn square(level: f64) -> WaveSpec {
        WaveSpec::periodic(WaveShape::Square, level, level, 1.0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_generator_writes_every_tick() {
        init_test_logging();
        let host = Arc::new(TestHost::default());
        let task = GeneratorTask::start(1, square(1.0), host.clone(), Duration::from_millis(10), LIMIT)
            .await
            .unwrap();
        // first tick is immediate
        assert_eq!(host.written.lock().len(), 1);

        tokio::time::sleep(Duration::from_millis(95)).await;
        assert_eq!(host.written.lock().len(), 10);

        task.stop(LIMIT).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(host.written.lock().len(), 10);
    }

    #[tokio::test]
    async fn test_stop_returns_within_a_tick() {
        init_test_logging();
        let host = Arc::new(TestHost::default());
        let task = GeneratorTask::start(2, square(1.0), host.clone(), Duration::from_millis(10), LIMIT)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(35)).await;

        let started = std::time::Instant::now();
        task.stop(LIMIT).await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_millis(20));

        let count = host.written.lock().len();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(host.written.lock().len(), count);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_cancels() {
        let host = Arc::new(TestHost::default());
        let task = GeneratorTask::start(3, square(1.0), host.clone(), Duration::from_millis(10), LIMIT)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        drop(task);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let count = host.written.lock().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(host.written.lock().len(), count);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failures_do_not_stop_generator() {
        init_test_logging();
        let host = Arc::new(TestHost {
            fail_first: 3,
            ..Default::default()
        });
        let task = GeneratorTask::start(4, square(2.0), host.clone(), Duration::from_millis(10), LIMIT)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(95)).await;
        task.stop(LIMIT).await.unwrap();

        assert_eq!(host.attempts.load(Ordering::SeqCst), 10);
        assert_eq!(*host.failures.lock(), vec![4, 4, 4]);
        assert_eq!(host.written.lock().len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_step_completes_task() {
        let host = Arc::new(TestHost::default());
        let ramp = WaveSpec::ramp(0.0, 3.0, Duration::from_millis(50));
        let task = GeneratorTask::start(5, ramp, host.clone(), Duration::from_millis(10), LIMIT)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*host.completed.lock(), Some(5));
        let written = host.written.lock().clone();
        assert_eq!(written.len(), 6);
        assert_eq!(written[0], 0.0);
        assert_eq!(*written.last().unwrap(), 3.0);

        // stopping a finished task is fine
        task.stop(LIMIT).await.unwrap();
    }

    // Single worker thread: a blocked write must not hold up the timeout.
    #[tokio::test]
    async fn test_stop_timeout_is_a_consistency_error() {
        init_test_logging();
        let host = Arc::new(TestHost {
            block_for: Some(std::time::Duration::from_millis(300)),
            ..Default::default()
        });
        let task = GeneratorTask::start(6, square(1.0), host.clone(), Duration::from_millis(10), LIMIT)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let result = task.stop(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::Consistency(_))));
        assert!(started.elapsed() < std::time::Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_first_write_is_bounded() {
        let host = Arc::new(TestHost {
            block_for: Some(std::time::Duration::from_millis(300)),
            ..Default::default()
        });
        let started = std::time::Instant::now();
        let result =
            GeneratorTask::start(7, square(1.0), host, Duration::from_millis(10), Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::Consistency(_))));
        assert!(started.elapsed() < std::time::Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_blocked_writer_does_not_stall_other_generators() {
        let slow = Arc::new(TestHost {
            block_for: Some(std::time::Duration::from_millis(150)),
            ..Default::default()
        });
        let fast = Arc::new(TestHost::default());
        let period = Duration::from_millis(10);
        let slow_task = GeneratorTask::start(8, square(1.0), slow, period, LIMIT).await.unwrap();
        let fast_task = GeneratorTask::start(9, square(2.0), fast.clone(), period, LIMIT).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fast.written.lock().len() >= 5);

        fast_task.stop(LIMIT).await.unwrap();
        slow_task.stop(LIMIT).await.unwrap();
    }

    #[test]
    fn test_write_gate_skips_revoked_writer() {
        let gate = WriteGate::default();
        let mut written = Vec::new();
        gate.grant(1);
        gate.write_as(1, || {
            written.push(1);
            Ok(())
        })
        .unwrap();
        gate.reclaim(|| written.push(0));
        gate.write_as(1, || {
            written.push(1);
            Ok(())
        })
        .unwrap();
        assert_eq!(written, vec![1, 0]);
    }

    #[test]
    fn test_toggle_alternates_from_high() {
        let clock = PhaseClock::new();
        let mut toggle = Toggle::default();
        let levels: Vec<bool> = (0..4)
            .map(|_| match toggle.next(&clock) {
                Step::Continue(level) => level,
                Step::Last(_) => panic!("toggle never ends"),
            })
            .collect();
        assert_eq!(levels, vec![true, false, true, false]);
    }

    #[test]
    fn test_pulse_is_high_then_low_then_done() {
        let clock = PhaseClock::new();
        let mut pulse = Pulse::default();
        assert!(matches!(pulse.next(&clock), Step::Continue(true)));
        assert!(matches!(pulse.next(&clock), Step::Last(false)));
    }
}
