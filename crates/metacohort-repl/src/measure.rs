//! Wall-clock measurement of contract calls.

use std::time::{Duration, Instant};
use tracing::debug;

/// Timer started when an operation begins.
#[derive(Debug, Clone, Copy)]
pub struct OpTimer {
    start: Instant,
}

impl OpTimer {
    /// Start timing now.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Time since the timer started.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Time since the timer started, in microseconds.
    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

impl Default for OpTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// A call's result together with how long it took.
#[derive(Debug)]
pub struct Measured<T> {
    /// Name of the measured operation.
    pub operation: &'static str,
    /// Wall-clock duration of the call.
    pub elapsed: Duration,
    /// What the call returned, unchanged.
    pub value: T,
}

impl<T> Measured<T> {
    /// Drop the timing and keep the result.
    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Run `f` and report its elapsed time alongside its result.
pub fn measure<T>(operation: &'static str, f: impl FnOnce() -> T) -> Measured<T> {
    let timer = OpTimer::new();
    let value = f();
    let elapsed = timer.elapsed();
    debug!("{} took {}us", operation, elapsed.as_micros());
    Measured {
        operation,
        elapsed,
        value,
    }
}
