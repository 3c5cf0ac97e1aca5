//! Scheduling clocks and playback drift reconciliation.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

/// Time source driving the scheduler loop.
pub trait SchedulingClock: Send {
    /// Time elapsed since the clock was created.
    fn now(&self) -> Duration;

    /// Waits for (or simulates) the passage of `dt`.
    fn advance(&mut self, dt: Duration);
}

/// Reports how far the external audio player has progressed.
pub trait PlaybackPosition: Send + Sync {
    /// Current playback position, or `None` when the player cannot tell.
    fn position_ms(&self) -> Option<f64>;
}

/// Wall-clock time backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulingClock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn advance(&mut self, dt: Duration) {
        thread::sleep(dt);
    }
}

/// Virtual clock that only moves when told to.
///
/// Clones share the same time, so a test can keep a handle while the scheduler
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, time: Duration) {
        self.nanos.store(duration_nanos(time), Ordering::Release);
    }

    pub fn elapsed_ms(&self) -> f64 {
        millis(self.now())
    }
}

impl SchedulingClock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }

    fn advance(&mut self, dt: Duration) {
        self.nanos.fetch_add(duration_nanos(dt), Ordering::AcqRel);
    }
}

impl PlaybackPosition for ManualClock {
    fn position_ms(&self) -> Option<f64> {
        Some(self.elapsed_ms())
    }
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Fractional milliseconds, exact for whole-millisecond durations.
pub fn millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

/// Result of comparing scheduler time with playback time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resync {
    /// Nothing to compare this time round.
    Skipped,
    /// Within tolerance; the scheduler should adopt `position_ms`.
    Adjusted { position_ms: f64, drift_ms: f64 },
    Exceeded { drift_ms: f64 },
}

/// Periodically measures drift between the scheduling clock and playback, and
/// keeps the correction applied to scheduler time.
#[derive(Debug, Clone)]
pub struct DriftReconciler {
    interval_ms: f64,
    tolerance_ms: f64,
    correction_ms: f64,
    last_check_ms: Option<f64>,
}

impl DriftReconciler {
    pub fn new(interval_ms: f64, tolerance_ms: f64) -> Self {
        Self {
            interval_ms,
            tolerance_ms,
            correction_ms: 0.0,
            last_check_ms: None,
        }
    }

    pub fn tolerance_ms(&self) -> f64 {
        self.tolerance_ms
    }

    /// Scheduler time for a raw clock reading.
    pub fn corrected(&self, clock_ms: f64) -> f64 {
        clock_ms + self.correction_ms
    }

    /// Compares playback with the corrected clock when a check is due.
    pub fn reconcile(&mut self, clock_ms: f64, playback: Option<&dyn PlaybackPosition>) -> Resync {
        let Some(playback) = playback else {
            return Resync::Skipped;
        };
        if let Some(last) = self.last_check_ms {
            if clock_ms - last < self.interval_ms {
                return Resync::Skipped;
            }
        }
        self.last_check_ms = Some(clock_ms);

        let Some(position_ms) = playback.position_ms() else {
            return Resync::Skipped;
        };
        let drift_ms = position_ms - self.corrected(clock_ms);
        if !drift_ms.is_finite() || drift_ms.abs() > self.tolerance_ms {
            return Resync::Exceeded { drift_ms };
        }
        self.correction_ms = position_ms - clock_ms;
        Resync::Adjusted {
            position_ms,
            drift_ms,
        }
    }
}
