use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{trace, warn};

use crate::error::SinkError;
use crate::sink::{DigitalSink, OutputSink};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SinkWrite {
    Voltage(f64),
    Current(f64),
    Relay(bool),
}

#[derive(Debug, Clone, Copy)]
pub struct SinkEvent {
    pub at: Instant,
    pub write: SinkWrite,
}

/// Stand-in for the I/O board when no hardware is attached. Every
/// successful write is logged and recorded; failures and bus latency can
/// be injected.
#[derive(Debug, Default)]
pub struct SimulatedBoard {
    events: Mutex<Vec<SinkEvent>>,
    pending_failures: AtomicUsize,
    write_delay: Mutex<Duration>,
}

impl SimulatedBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes (any output) fail with a bus error.
    pub fn fail_next(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Blocks the writing thread this long on every write, like a slow bus.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn voltages(&self) -> Vec<f64> {
        self.filter(|w| match w {
            SinkWrite::Voltage(v) => Some(v),
            _ => None,
        })
    }

    pub fn currents(&self) -> Vec<f64> {
        self.filter(|w| match w {
            SinkWrite::Current(v) => Some(v),
            _ => None,
        })
    }

    pub fn relay_levels(&self) -> Vec<bool> {
        self.filter(|w| match w {
            SinkWrite::Relay(level) => Some(level),
            _ => None,
        })
    }

    fn filter<T>(&self, pick: impl Fn(SinkWrite) -> Option<T>) -> Vec<T> {
        self.events.lock().iter().filter_map(|e| pick(e.write)).collect()
    }

    fn record(&self, write: SinkWrite) -> Result<(), SinkError> {
        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            warn!("[sim] injected failure for {:?}", write);
            return Err(SinkError::Bus("simulated bus error".into()));
        }
        trace!("[sim] {:?}", write);
        self.events.lock().push(SinkEvent {
            at: Instant::now(),
            write,
        });
        Ok(())
    }
}

impl OutputSink for SimulatedBoard {
    fn write_voltage(&self, value: f64) -> Result<(), SinkError> {
        self.record(SinkWrite::Voltage(value))
    }

    fn write_current(&self, value: f64) -> Result<(), SinkError> {
        self.record(SinkWrite::Current(value))
    }
}

impl DigitalSink for SimulatedBoard {
    fn set_state(&self, high: bool) -> Result<(), SinkError> {
        self.record(SinkWrite::Relay(high))
    }
}
