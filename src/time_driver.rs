//! embassy-time driver running on a scaled virtual clock.
//!
//! Virtual time advances at `speed_percent` of host time, so a 60 s protocol
//! period can be watched in 6 s at 1000 %. Speed changes re-anchor the
//! mapping at the current instant: virtual time never jumps and timers
//! already queued keep their virtual deadlines.

use core::task::Waker;
use embassy_time_driver::{Driver, TICK_HZ, time_driver_impl};
use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant as StdInstant};

pub const MIN_SPEED_PERCENT: u32 = 1;
pub const MAX_SPEED_PERCENT: u32 = 1000;

/// Q32.32 fixed point; `RATE_ONE` is real-time speed.
const RATE_ONE: u64 = 1u64 << 32;

/// Upper bound on one condvar wait so rescaling takes effect even without a notify.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(25);

/// Linear mapping between host instants and virtual embassy ticks:
/// `ticks = origin_ticks + (real - origin_real) * rate`.
#[derive(Debug, Clone, Copy)]
struct VirtualClock {
    origin_real: StdInstant,
    origin_ticks: u64,
    rate_q32: u64,
    /// Requested percent, kept exact for readback.
    percent: u32,
}

impl VirtualClock {
    fn new(origin_real: StdInstant) -> Self {
        Self { origin_real, origin_ticks: 0, rate_q32: RATE_ONE, percent: 100 }
    }

    fn to_ticks(&self, real: StdInstant) -> u64 {
        let elapsed = real.saturating_duration_since(self.origin_real);
        let real_ticks = elapsed.as_nanos() * TICK_HZ as u128 / 1_000_000_000;
        let scaled = real_ticks * self.rate_q32 as u128 / RATE_ONE as u128;
        self.origin_ticks.saturating_add(scaled.min(u64::MAX as u128) as u64)
    }

    /// Host instant at which virtual time reaches `ticks`. Deadlines before
    /// the origin are already due.
    fn to_real(&self, ticks: u64) -> StdInstant {
        let Some(virtual_dt) = ticks.checked_sub(self.origin_ticks) else {
            return self.origin_real;
        };
        let real_ticks = virtual_dt as u128 * RATE_ONE as u128 / self.rate_q32 as u128;
        let nanos = real_ticks * 1_000_000_000 / TICK_HZ as u128;
        self.origin_real + Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    /// Switch to `percent` at host instant `now` without moving virtual time.
    ///
    /// Only `origin_real` shifts; `origin_ticks` stays put so queued
    /// deadlines cannot end up before the origin.
    fn rescale(&mut self, now: StdInstant, percent: u32) {
        let current = self.to_ticks(now);
        let rate_q32 = (percent as u128 * RATE_ONE as u128 / 100) as u64;
        let virtual_dt = current.saturating_sub(self.origin_ticks) as u128;
        let real_ticks = virtual_dt * RATE_ONE as u128 / rate_q32.max(1) as u128;
        let nanos = real_ticks * 1_000_000_000 / TICK_HZ as u128;
        let back = Duration::from_nanos(nanos.min(u64::MAX as u128) as u64);
        self.origin_real = now.checked_sub(back).unwrap_or(now);
        self.rate_q32 = rate_q32;
        self.percent = percent;
    }
}

/// Pending wakers keyed by virtual deadline.
#[derive(Default)]
struct WakeQueue {
    deadlines: BTreeMap<u64, Vec<Waker>>,
    /// Bumped on every rescale so a sleeping scheduler recomputes its target.
    generation: u64,
}

impl WakeQueue {
    fn insert(&mut self, at: u64, waker: &Waker) {
        let wakers = self.deadlines.entry(at).or_default();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    fn earliest(&self) -> Option<u64> {
        self.deadlines.keys().next().copied()
    }

    fn drain_due(&mut self, now: u64) -> Vec<Waker> {
        let later = self.deadlines.split_off(&now.saturating_add(1));
        let due = std::mem::replace(&mut self.deadlines, later);
        due.into_values().flatten().collect()
    }
}

static CLOCK: OnceLock<Mutex<VirtualClock>> = OnceLock::new();
static QUEUE: OnceLock<Mutex<WakeQueue>> = OnceLock::new();
static QUEUE_CHANGED: Condvar = Condvar::new();
static SCHEDULER_STARTED: OnceLock<()> = OnceLock::new();

/// A panic while holding one of these locks cannot leave the clock or the
/// queue half-updated, so poisoned locks are used as-is.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn clock() -> MutexGuard<'static, VirtualClock> {
    lock(CLOCK.get_or_init(|| Mutex::new(VirtualClock::new(StdInstant::now()))))
}

fn queue() -> MutexGuard<'static, WakeQueue> {
    lock(QUEUE.get_or_init(|| Mutex::new(WakeQueue::default())))
}

fn ensure_scheduler_thread() {
    SCHEDULER_STARTED.get_or_init(|| {
        if let Err(e) = std::thread::Builder::new().name("virtual-time-scheduler".into()).spawn(scheduler_thread) {
            log::error!("Failed to start virtual time scheduler: {}", e);
        }
    });
}

/// Sleeps until the earliest queued deadline, then wakes every due waker.
///
/// The clock and the queue are never locked at the same time.
fn scheduler_thread() {
    loop {
        let (next_at, generation) = {
            let mut guard = queue();
            loop {
                if let Some(at) = guard.earliest() {
                    break (at, guard.generation);
                }
                guard = QUEUE_CHANGED.wait(guard).unwrap_or_else(PoisonError::into_inner);
            }
        };

        let target = clock().to_real(next_at);
        let now = StdInstant::now();
        if target > now {
            let guard = queue();
            if guard.generation == generation {
                let wait = (target - now).min(MAX_WAIT_SLICE);
                let _ = QUEUE_CHANGED.wait_timeout(guard, wait).unwrap_or_else(PoisonError::into_inner);
            }
            continue;
        }

        let now_ticks = clock().to_ticks(StdInstant::now());
        let ready = queue().drain_due(now_ticks);
        for waker in ready {
            waker.wake();
        }
    }
}

struct VirtualTimeDriver;

impl Driver for VirtualTimeDriver {
    fn now(&self) -> u64 {
        clock().to_ticks(StdInstant::now())
    }

    fn schedule_wake(&self, at: u64, waker: &Waker) {
        ensure_scheduler_thread();
        queue().insert(at, waker);
        QUEUE_CHANGED.notify_all();
    }
}

time_driver_impl!(static DRIVER: VirtualTimeDriver = VirtualTimeDriver);

/// Set the virtual clock speed. Values outside 1..=1000 are clamped.
pub fn set_simulation_speed_percent(percent: u32) {
    let clamped = percent.clamp(MIN_SPEED_PERCENT, MAX_SPEED_PERCENT);
    if clamped != percent {
        log::warn!("Simulation speed {}% clamped to {}%", percent, clamped);
    }
    {
        let mut clock = clock();
        if clock.percent == clamped {
            return;
        }
        clock.rescale(StdInstant::now(), clamped);
    }
    {
        let mut queue = queue();
        queue.generation = queue.generation.wrapping_add(1);
    }
    QUEUE_CHANGED.notify_all();
}

pub fn get_simulation_speed_percent() -> u32 {
    clock().percent
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn rescale_keeps_virtual_time_continuous() {
        let start = StdInstant::now();
        let mut clock = VirtualClock::new(start);
        let later = start + Duration::from_millis(300);
        let before = clock.to_ticks(later);
        clock.rescale(later, 400);
        let after = clock.to_ticks(later);
        assert!(before.abs_diff(after) <= TICK_HZ / 1000, "jump of {} ticks", before.abs_diff(after));
        assert_eq!(clock.percent, 400);
    }

    #[test]
    fn faster_clock_reaches_deadlines_sooner() {
        let start = StdInstant::now();
        let mut clock = VirtualClock::new(start);
        clock.rescale(start, 200);
        // 0.2 virtual seconds at 200% take 0.1 real seconds
        let real = clock.to_real(clock.to_ticks(start) + TICK_HZ / 5);
        let secs = real.duration_since(start).as_secs_f64();
        assert!((secs - 0.1).abs() < 0.001, "got {secs}s");
    }

    #[test]
    fn deadlines_before_origin_are_due_at_origin() {
        let start = StdInstant::now();
        let mut clock = VirtualClock::new(start);
        clock.origin_ticks = 1_000;
        assert_eq!(clock.to_real(999), start);
    }

    #[test]
    fn wake_queue_drains_only_due_entries() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        let mut queue = WakeQueue::default();
        queue.insert(10, &waker);
        queue.insert(10, &waker);
        queue.insert(20, &waker);
        assert_eq!(queue.earliest(), Some(10));

        let ready = queue.drain_due(15);
        assert_eq!(ready.len(), 1);
        ready.into_iter().for_each(Waker::wake);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(queue.earliest(), Some(20));
        assert_eq!(queue.drain_due(20).len(), 1);
        assert_eq!(queue.earliest(), None);
    }

    #[test]
    fn speed_is_clamped() {
        set_simulation_speed_percent(5000);
        assert_eq!(get_simulation_speed_percent(), MAX_SPEED_PERCENT);
        set_simulation_speed_percent(0);
        assert_eq!(get_simulation_speed_percent(), MIN_SPEED_PERCENT);
        set_simulation_speed_percent(100);
        assert_eq!(get_simulation_speed_percent(), 100);
    }
}
