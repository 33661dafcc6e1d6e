//! Write Throttle
//!
//! Derives a per-key write delay from how expensive recent compactions were
//! and how many are waiting.
//!
//! ## Intervals:
//! ```text
//! slot 0      level-0 compactions of the current interval
//! slot 1      level 1+ compactions of the current interval
//! slot 2..63  finished level 1+ intervals (ring, about one hour)
//! ```
//! Once per interval the throttle thread folds slot 1 into the ring, sums
//! the ring, and moves the published rate a small step toward the new goal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

/// Ring size including the two accumulation slots
pub const THROTTLE_INTERVALS: usize = 63;

/// Damping of rate changes between intervals
const THROTTLE_SCALING: i64 = 17;

const LEVEL0_SLOT: usize = 0;
const LEVEL1_SLOT: usize = 1;
const FIRST_RING_SLOT: usize = 2;

// =============================================================================
// Cached Clock
// =============================================================================

/// Wall clock refreshed once per throttle interval
///
/// Expiry checks read this instead of asking the OS on every key.
#[derive(Debug)]
pub struct CachedClock {
    micros: AtomicU64,
}

impl CachedClock {
    pub fn new() -> Self {
        let clock = Self {
            micros: AtomicU64::new(0),
        };
        clock.refresh();
        clock
    }

    pub fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::Acquire)
    }

    pub fn set_micros(&self, micros: u64) {
        self.micros.store(micros, Ordering::Release);
    }

    /// Reload from the system clock
    pub fn refresh(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        self.set_micros(now);
    }
}

impl Default for CachedClock {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Throttle State
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct IntervalData {
    micros: u64,
    keys: u64,
    backlog: u64,
    compactions: u64,
}

/// Compaction statistics and the rate derived from them
#[derive(Debug, Clone)]
pub struct ThrottleState {
    slots: [IntervalData; THROTTLE_INTERVALS],
    replace_idx: usize,
    rate: u64,
    unadjusted_rate: u64,
}

impl Default for ThrottleState {
    fn default() -> Self {
        Self {
            slots: [IntervalData::default(); THROTTLE_INTERVALS],
            replace_idx: FIRST_RING_SLOT,
            rate: 0,
            unadjusted_rate: 1,
        }
    }
}

impl ThrottleState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one finished compaction that took `micros` for `keys` keys
    pub fn record_compaction(&mut self, micros: u64, keys: u64, is_level0: bool) {
        let slot = &mut self.slots[if is_level0 { LEVEL0_SLOT } else { LEVEL1_SLOT }];
        slot.micros += micros;
        slot.keys += keys;
        slot.backlog = 0;
        slot.compactions += 1;
    }

    /// Close the current interval and recompute the rate
    ///
    /// `level0_backlog` and `compaction_backlog` are the queue depths of the
    /// level-0 and general compaction pools right now.
    pub fn roll_interval(&mut self, level0_backlog: u64, compaction_backlog: u64) {
        let idx = self.replace_idx;
        self.slots[idx] = self.slots[LEVEL1_SLOT];
        self.slots[idx].backlog = 0;
        self.slots[LEVEL1_SLOT] = IntervalData::default();

        let mut total = IntervalData::default();
        for slot in &self.slots[FIRST_RING_SLOT..] {
            total.micros += slot.micros;
            total.keys += slot.keys;
            total.backlog += slot.backlog;
            total.compactions += slot.compactions;
        }

        // Backlogs are sampled now and weigh in from the next interval on
        self.slots[idx].backlog = compaction_backlog;
        self.slots[LEVEL0_SLOT].backlog = level0_backlog;

        let level0 = self.slots[LEVEL0_SLOT];
        let mut new_unadjusted = self.unadjusted_rate;
        let new_throttle = if total.keys != 0 {
            let compactions = total.compactions.max(1);

            // x100 keeps two fractional digits through integer math
            let per_key = (total.micros * 100) / total.keys;
            let throttle = (per_key * ((total.backlog * 100) / compactions)) / 10_000;

            new_unadjusted = (per_key / 100).max(1);
            throttle.max(1)
        } else if level0.keys != 0 && level0.compactions != 0 {
            // Only level-0 history so far, e.g. right after a restart
            let per_key = level0.micros / level0.keys;
            new_unadjusted = per_key.max(1);
            per_key * (level0.backlog / level0.compactions)
        } else {
            1
        };

        self.rate = smooth_rate(self.rate, new_throttle);
        self.unadjusted_rate = new_unadjusted;

        self.slots[LEVEL0_SLOT] = IntervalData::default();
        self.replace_idx += 1;
        if self.replace_idx == THROTTLE_INTERVALS {
            self.replace_idx = FIRST_RING_SLOT;
        }
    }

    /// Smoothed per-key delay in micros
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Average micros per compacted key, ignoring backlog
    pub fn unadjusted_rate(&self) -> u64 {
        self.unadjusted_rate
    }
}

/// One step of `current` toward `goal`; decreases move faster, floor of 1
pub fn smooth_rate(current: u64, goal: u64) -> u64 {
    let current = current as i64;
    let goal = goal as i64;
    let next = if current < goal {
        current + (goal - current) / THROTTLE_SCALING + 1
    } else {
        current - ((current - goal) / THROTTLE_SCALING + 2)
    };
    next.max(1) as u64
}

// =============================================================================
// Throttle Thread
// =============================================================================

/// What the throttle thread needs from the runtime around it
pub trait ThrottleProbe: Send + Sync {
    /// Queue depths of the level-0 and general compaction pools
    fn backlogs(&self) -> (u64, u64);

    /// Runs after each interval; the context uses it to offer idle
    /// compaction capacity to every open database
    fn interval_elapsed(&self);
}

struct Shared {
    state: Mutex<ThrottleState>,
    running: Mutex<bool>,
    wakeup: Condvar,
    clock: Arc<CachedClock>,
}

/// Periodic throttle recalculation on its own thread
pub struct WriteThrottle {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WriteThrottle {
    /// Spawn the thread; it runs until [`WriteThrottle::stop_thread`]
    pub fn start(interval: Duration, clock: Arc<CachedClock>, probe: Arc<dyn ThrottleProbe>) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(ThrottleState::new()),
            running: Mutex::new(true),
            wakeup: Condvar::new(),
            clock,
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("stratakv-throttle".into())
            .spawn(move || throttle_loop(thread_shared, interval, probe))
            .map_err(|e| {
                error!(error = %e, "failed to spawn throttle thread");
                e
            })?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn record_compaction(&self, micros: u64, keys: u64, is_level0: bool) {
        self.shared.state.lock().record_compaction(micros, keys, is_level0);
    }

    pub fn rate(&self) -> u64 {
        self.shared.state.lock().rate()
    }

    pub fn unadjusted_rate(&self) -> u64 {
        self.shared.state.lock().unadjusted_rate()
    }

    pub fn clock(&self) -> &Arc<CachedClock> {
        &self.shared.clock
    }

    /// First step of shutdown: stop the interval loop so it no longer
    /// schedules compactions. Safe to call more than once.
    pub fn stop_thread(&self) {
        {
            let mut running = self.shared.running.lock();
            *running = false;
            self.shared.wakeup.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            // the throttle thread may itself drop the last context owner
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        *self.shared.running.lock()
    }
}

impl Drop for WriteThrottle {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

fn throttle_loop(shared: Arc<Shared>, interval: Duration, probe: Arc<dyn ThrottleProbe>) {
    info!(interval_secs = interval.as_secs_f64(), "Throttle thread started");

    loop {
        shared.clock.refresh();

        {
            let mut running = shared.running.lock();
            if !*running {
                break;
            }
            shared.wakeup.wait_for(&mut running, interval);
            if !*running {
                break;
            }
        }

        let (level0_backlog, compaction_backlog) = probe.backlogs();
        let (rate, unadjusted) = {
            let mut state = shared.state.lock();
            state.roll_interval(level0_backlog, compaction_backlog);
            (state.rate(), state.unadjusted_rate())
        };
        debug!(rate, unadjusted, level0_backlog, compaction_backlog, "Throttle rate");

        probe.interval_elapsed();
    }

    info!("Throttle thread stopped");
}
