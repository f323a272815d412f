use tokio::time::{Duration, Instant};

/// Time base for a running generator. The origin is re-anchored on every
/// (re)start so a new waveform always begins at phase 0.
#[derive(Debug, Clone, Copy)]
pub struct PhaseClock {
    origin: Instant,
}

impl Default for PhaseClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    /// Records "now" as the new origin.
    pub fn reset(&mut self) {
        self.origin = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Position inside the current cycle, in [0, 1).
    pub fn phase(&self, frequency: f64) -> f64 {
        phase_at(self.elapsed(), frequency)
    }
}

/// `(elapsed * frequency) mod 1.0` for a non-negative frequency.
pub fn phase_at(elapsed: Duration, frequency: f64) -> f64 {
    let cycles = elapsed.as_secs_f64() * frequency;
    let phase = cycles.fract();
    if (0.0..1.0).contains(&phase) {
        phase
    } else {
        0.0
    }
}
