use std::sync::{Mutex, MutexGuard};

/// Number of one-second samples in the flow-rate window.
pub const FLOW_WINDOW: usize = 5;
const SECS_PER_MINUTE: f32 = 60.0;

/// Pulse accumulator fed by the flow meter's falling edges.
///
/// `pulse` only ever holds the lock for a single increment, so the interrupt side
/// never waits longer than a concurrent [`TickCounter::read_pair`].
#[derive(Debug, Default)]
pub struct TickCounter {
    count: Mutex<u32>,
}

impl TickCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pulse(&self) {
        let mut count = self.lock();
        *count = count.wrapping_add(1);
    }

    pub fn load(&self) -> u32 {
        *self.lock()
    }

    /// Runs `f` with the current count while pulses are held off, so whatever `f`
    /// pairs with the count (a timestamp) is consistent with it.
    pub fn read_pair<R>(&self, f: impl FnOnce(u32) -> R) -> R {
        let count = self.lock();
        f(*count)
    }

    fn lock(&self) -> MutexGuard<'_, u32> {
        self.count.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Sliding-window derivative of the cumulative tick count.
///
/// The window holds the last [`FLOW_WINDOW`] `(timestamp, ticks)` samples and the
/// delta is scaled by the seconds actually spanned, so a skipped second widens the
/// window instead of inflating the rate.
#[derive(Debug, Default, Clone)]
pub struct FlowRateEstimator {
    history: [(u32, u32); FLOW_WINDOW],
    next: usize,
    recorded: usize,
    current: Option<f32>,
    baseline: Option<f32>,
}

impl FlowRateEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the tick count read at `timestamp`. Returns the flow rate in ticks per
    /// minute, or `None` until a full window of earlier samples is available.
    pub fn record(&mut self, timestamp: u32, ticks: u32) -> Option<f32> {
        let (then, oldest) = self.history[self.next];
        let elapsed = timestamp.wrapping_sub(then);
        self.current = (self.recorded >= FLOW_WINDOW && elapsed > 0).then(|| {
            ticks.wrapping_sub(oldest) as f32 * SECS_PER_MINUTE / elapsed as f32
        });
        self.history[self.next] = (timestamp, ticks);
        self.next = (self.next + 1) % FLOW_WINDOW;
        self.recorded = self.recorded.saturating_add(1);
        self.current
    }

    /// Latches the current rate as the baseline. Does nothing once a baseline is
    /// held or while the window is still warming up; returns whether it latched.
    pub fn capture_baseline(&mut self) -> bool {
        if self.baseline.is_some() {
            return false;
        }
        self.baseline = self.current;
        self.baseline.is_some()
    }

    pub fn baseline(&self) -> Option<f32> {
        self.baseline
    }
}
