use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// A named stopwatch inside a `TimerSet`.
///
/// Accumulates wall time over start/stop laps; `reset` clears everything.
#[derive(Debug, Default)]
pub struct Stopwatch {
    started: Option<Instant>,
    total: Duration,
    laps: u64,
}

impl Stopwatch {
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.total
    }

    #[inline]
    pub fn laps(&self) -> u64 {
        self.laps
    }

    /// The mean lap duration, zero before the first completed lap.
    pub fn mean(&self) -> Duration {
        if self.laps == 0 {
            return Duration::ZERO;
        }
        self.total / self.laps as u32
    }
}

/// Lazily created named stopwatches, shared through the hook context.
///
/// All timing runs on the control task, so the registry needs no interior
/// locking. Iteration order is the sorted name order.
#[derive(Debug, Default)]
pub struct TimerSet {
    timers: BTreeMap<String, Stopwatch>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts (or restarts) the named stopwatch's current lap.
    pub fn start(&mut self, name: &str) {
        let timer = self.entry(name);
        timer.started = Some(Instant::now());
    }

    /// Stops the current lap and returns its duration.
    ///
    /// Stopping a stopwatch that is not running returns zero and counts
    /// no lap.
    pub fn stop(&mut self, name: &str) -> Duration {
        let timer = self.entry(name);

        let Some(started) = timer.started.take() else {
            return Duration::ZERO;
        };

        let lap = started.elapsed();
        timer.total += lap;
        timer.laps += 1;
        lap
    }

    /// Clears the named stopwatch back to zero.
    pub fn reset(&mut self, name: &str) {
        *self.entry(name) = Stopwatch::default();
    }

    /// The accumulated time over all completed laps.
    pub fn elapsed(&self, name: &str) -> Duration {
        self.timers.get(name).map(Stopwatch::elapsed).unwrap_or_default()
    }

    /// The number of completed laps.
    pub fn laps(&self, name: &str) -> u64 {
        self.timers.get(name).map(Stopwatch::laps).unwrap_or_default()
    }

    /// The mean lap duration.
    pub fn mean(&self, name: &str) -> Duration {
        self.timers.get(name).map(Stopwatch::mean).unwrap_or_default()
    }

    /// All stopwatches in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Stopwatch)> {
        self.timers.iter().map(|(name, timer)| (name.as_str(), timer))
    }

    fn entry(&mut self, name: &str) -> &mut Stopwatch {
        self.timers.entry(name.to_string()).or_default()
    }
}
