use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use crate::flow::TickCounter;

/// Epoch-seconds time source for sample timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> u32;
}

/// Host clock corrected by the offset learned from the remote service.
#[derive(Debug, Clone, Default)]
pub struct SyncedClock {
    offset: Arc<AtomicI64>,
}

impl SyncedClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, epoch_secs: i64) {
        let offset = epoch_secs - Utc::now().timestamp();
        self.offset.store(offset, Ordering::SeqCst);
        info!(epoch_secs, offset, "Clock synchronised");
    }
}

impl Clock for SyncedClock {
    fn now(&self) -> u32 {
        let now = Utc::now().timestamp() + self.offset.load(Ordering::SeqCst);
        now.clamp(0, u32::MAX as i64) as u32
    }
}

/// A (timestamp, ticks) pair read together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSnapshot {
    pub timestamp: u32,
    pub ticks: u32,
}

/// Single-producer/single-consumer handoff between the timer and the control loop.
/// Holds at most one snapshot; a newer one replaces an unconsumed one.
#[derive(Debug, Default)]
pub struct SampleSlot {
    cell: Mutex<Option<SampleSnapshot>>,
    ready: Notify,
}

impl SampleSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when an unconsumed snapshot was overwritten.
    pub fn publish(&self, snapshot: SampleSnapshot) -> bool {
        let overwritten = self
            .cell
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(snapshot)
            .is_some();
        self.ready.notify_one();
        overwritten
    }

    pub fn take(&self) -> Option<SampleSnapshot> {
        self.cell
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    pub async fn next(&self) -> SampleSnapshot {
        loop {
            if let Some(snapshot) = self.take() {
                return snapshot;
            }
            self.ready.notified().await;
        }
    }
}

/// Periodic timer that snapshots the tick counter against the clock.
pub struct SampleClock<C> {
    counter: Arc<TickCounter>,
    clock: C,
    slot: Arc<SampleSlot>,
    period: Duration,
}

impl<C: Clock + 'static> SampleClock<C> {
    pub fn new(counter: Arc<TickCounter>, clock: C, slot: Arc<SampleSlot>, period: Duration) -> Self {
        SampleClock {
            counter,
            clock,
            slot,
            period,
        }
    }

    pub fn capture(&self) -> SampleSnapshot {
        self.counter.read_pair(|ticks| SampleSnapshot {
            timestamp: self.clock.now(),
            ticks,
        })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let snapshot = self.capture();
                if self.slot.publish(snapshot) {
                    warn!(timestamp = snapshot.timestamp, "Previous sample was not consumed in time");
                }
            }
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ManualClock;
    use super::*;

    #[test]
    fn synced_clock_follows_remote_time() {
        let clock = SyncedClock::new();
        clock.set(1_600_000_000);
        let now = clock.now();
        assert!((1_600_000_000..1_600_000_005).contains(&now));
    }

    #[test]
    fn slot_keeps_only_the_latest_snapshot() {
        let slot = SampleSlot::new();
        assert_eq!(slot.take(), None);
        assert!(!slot.publish(SampleSnapshot { timestamp: 1, ticks: 10 }));
        assert!(slot.publish(SampleSnapshot { timestamp: 2, ticks: 20 }));
        assert_eq!(slot.take(), Some(SampleSnapshot { timestamp: 2, ticks: 20 }));
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn capture_pairs_ticks_with_time() {
        let counter = Arc::new(TickCounter::new());
        let clock = ManualClock::at(100);
        let sampler = SampleClock::new(
            Arc::clone(&counter),
            clock.clone(),
            Arc::new(SampleSlot::new()),
            Duration::from_secs(1),
        );
        for _ in 0..7 {
            counter.pulse();
        }
        clock.advance(1);
        assert_eq!(sampler.capture(), SampleSnapshot { timestamp: 101, ticks: 7 });
    }

    #[tokio::test]
    async fn timer_hands_snapshots_to_the_consumer() {
        let counter = Arc::new(TickCounter::new());
        let slot = Arc::new(SampleSlot::new());
        let handle = SampleClock::new(
            Arc::clone(&counter),
            ManualClock::at(5),
            Arc::clone(&slot),
            Duration::from_millis(5),
        )
        .spawn();

        let first = slot.next().await;
        assert_eq!(first.timestamp, 5);
        counter.pulse();
        let later = loop {
            let snapshot = slot.next().await;
            if snapshot.ticks == 1 {
                break snapshot;
            }
        };
        assert_eq!(later.ticks, 1);
        handle.abort();
    }
}
