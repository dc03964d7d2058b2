//! Virtual time: wall-clock elapsed scaled by the configured factor.
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct VirtualClock {
    started: Instant,
    time_scale: f64,
}

impl VirtualClock {
    pub fn new(time_scale: f64) -> VirtualClock {
        VirtualClock {
            started: Instant::now(),
            time_scale,
        }
    }

    pub fn restart(&mut self) {
        self.started = Instant::now();
    }

    /// Current virtual time in milliseconds.
    pub fn now_ms(&self) -> i64 {
        (self.started.elapsed().as_secs_f64() * 1000.0 * self.time_scale) as i64
    }

    pub fn time_scale(&self) -> f64 {
        self.time_scale
    }
}
