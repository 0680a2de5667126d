//! Local clocks, durations and timeout bookkeeping.

use std::sync::atomic;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Local time.
///
/// This clock is monotonic: it never goes backwards even if the system
/// clock does.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Default)]
pub struct LocalTime {
    /// Milliseconds since Epoch.
    millis: u64,
}

impl std::fmt::Display for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_secs())
    }
}

impl LocalTime {
    /// Construct a local time from the current system time.
    pub fn now() -> Self {
        static LAST: atomic::AtomicU64 = atomic::AtomicU64::new(0);

        let now = Self::from(SystemTime::now()).millis;
        let last = LAST.load(atomic::Ordering::SeqCst);

        // If the current time is in the past, return the last recorded time.
        if now < last {
            Self { millis: last }
        } else {
            LAST.store(now, atomic::Ordering::SeqCst);
            Self { millis: now }
        }
    }

    /// Construct a local time from whole seconds since Epoch.
    pub const fn from_secs(secs: u64) -> Self {
        Self {
            millis: secs * 1000,
        }
    }

    /// Whole seconds since Epoch.
    pub const fn as_secs(&self) -> u64 {
        self.millis / 1000
    }

    /// The absolute difference between two times.
    pub fn diff(&self, other: LocalTime) -> LocalDuration {
        if self > &other {
            *self - other
        } else {
            other - *self
        }
    }
}

impl From<SystemTime> for LocalTime {
    fn from(system: SystemTime) -> Self {
        let millis = system
            .duration_since(UNIX_EPOCH)
            .expect("system time is past the epoch")
            .as_millis() as u64;

        Self { millis }
    }
}

/// Subtract two local times. Yields a duration, saturating at zero.
impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.millis.saturating_sub(other.millis))
    }
}

/// Subtract a duration from a local time, saturating at the epoch.
impl std::ops::Sub<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn sub(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            millis: self.millis.saturating_sub(other.as_millis()),
        }
    }
}

/// Add a duration to a local time. Yields a local time.
impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            millis: self.millis + other.0,
        }
    }
}

/// Time duration as measured locally.
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Default)]
pub struct LocalDuration(u64);

impl LocalDuration {
    /// Create a new duration from whole seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1000)
    }

    /// Construct a new duration from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// The number of whole seconds in this duration.
    pub const fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// The number of milliseconds in this duration.
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Clamp this duration between `min` and `max`.
    pub fn clamp(self, min: Self, max: Self) -> Self {
        Self(self.0.clamp(min.0, max.0))
    }
}

impl std::fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 < 1000 {
            write!(f, "{} millisecond(s)", self.as_millis())
        } else {
            write!(f, "{} second(s)", self.as_secs())
        }
    }
}

impl std::ops::Add<LocalDuration> for LocalDuration {
    type Output = LocalDuration;

    fn add(self, other: LocalDuration) -> LocalDuration {
        LocalDuration(self.0 + other.0)
    }
}

impl std::ops::Mul<u64> for LocalDuration {
    type Output = LocalDuration;

    fn mul(self, other: u64) -> LocalDuration {
        LocalDuration(self.0 * other)
    }
}

impl From<LocalDuration> for std::time::Duration {
    fn from(other: LocalDuration) -> Self {
        std::time::Duration::from_millis(other.0)
    }
}

/// Clock that tells the time.
pub trait Clock: Clone {
    /// Tell the time in local time.
    fn local_time(&self) -> LocalTime;
}

/// A frozen clock. Useful as a building block; mostly used through
/// [`RefClock`] in tests.
impl Clock for LocalTime {
    fn local_time(&self) -> LocalTime {
        *self
    }
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn local_time(&self) -> LocalTime {
        LocalTime::now()
    }
}

/// Clock with interior mutability, settable from the outside. The state
/// machine managers clone it; the reactor (or a test) advances it.
#[derive(Debug, Clone)]
pub struct RefClock {
    inner: Arc<Mutex<LocalTime>>,
}

impl RefClock {
    pub fn new(time: LocalTime) -> Self {
        Self {
            inner: Arc::new(Mutex::new(time)),
        }
    }

    /// Set the clock to the given time.
    pub fn set(&self, time: LocalTime) {
        *self.inner.lock().unwrap() = time;
    }

    /// Advance the clock by the given duration.
    pub fn elapse(&self, duration: LocalDuration) {
        let mut time = self.inner.lock().unwrap();
        *time = *time + duration;
    }
}

impl Clock for RefClock {
    fn local_time(&self) -> LocalTime {
        *self.inner.lock().unwrap()
    }
}

/// Manages timers and triggers timeouts.
pub struct TimeoutManager<K> {
    timeouts: Vec<(K, LocalTime)>,
    threshold: LocalDuration,
}

impl<K> TimeoutManager<K> {
    /// Create a new timeout manager.
    ///
    /// Takes a threshold below which two timeouts cannot overlap.
    pub fn new(threshold: LocalDuration) -> Self {
        Self {
            timeouts: vec![],
            threshold,
        }
    }

    /// The number of timeouts being tracked.
    pub fn len(&self) -> usize {
        self.timeouts.len()
    }

    /// Whether there are timeouts being tracked.
    pub fn is_empty(&self) -> bool {
        self.timeouts.is_empty()
    }

    /// Register a new timeout with an associated key and wake-up time.
    /// Timeouts that land within the threshold of an existing one are
    /// coalesced away.
    pub fn register(&mut self, key: K, time: LocalTime) -> bool {
        if self
            .timeouts
            .iter()
            .any(|(_, t)| t.diff(time) < self.threshold)
        {
            return false;
        }

        self.timeouts.push((key, time));
        self.timeouts.sort_unstable_by(|(_, a), (_, b)| b.cmp(a));

        true
    }

    /// The minimum duration to wait for the next timeout to be reached.
    /// `None` if there are no timeouts.
    pub fn next(&self, now: impl Into<LocalTime>) -> Option<LocalDuration> {
        let now = now.into();

        self.timeouts.last().map(|(_, t)| {
            if *t >= now {
                *t - now
            } else {
                LocalDuration::from_secs(0)
            }
        })
    }

    /// Populate `woken` with the keys that have timed out by `now`. Returns
    /// the number of keys that timed out.
    pub fn wake(&mut self, now: LocalTime, woken: &mut Vec<K>) -> usize {
        let before = woken.len();

        while let Some((k, t)) = self.timeouts.pop() {
            if now >= t {
                woken.push(k);
            } else {
                self.timeouts.push((k, t));
                break;
            }
        }
        woken.len() - before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_wake_in_order() {
        let mut mgr = TimeoutManager::new(LocalDuration::from_secs(0));
        let base = LocalTime::from_secs(100);

        mgr.register("a", base + LocalDuration::from_secs(5));
        mgr.register("b", base + LocalDuration::from_secs(1));
        mgr.register("c", base + LocalDuration::from_secs(3));

        let mut woken = Vec::new();
        let n = mgr.wake(base + LocalDuration::from_secs(3), &mut woken);

        assert_eq!(n, 2);
        assert_eq!(woken, vec!["b", "c"]);
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn close_timeouts_are_coalesced() {
        let mut mgr = TimeoutManager::new(LocalDuration::from_secs(1));
        let base = LocalTime::from_secs(100);

        assert!(mgr.register((), base + LocalDuration::from_secs(5)));
        assert!(!mgr.register((), base + LocalDuration::from_millis(5400)));
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn ref_clock_is_shared() {
        let clock = RefClock::new(LocalTime::from_secs(10));
        let other = clock.clone();

        clock.elapse(LocalDuration::from_secs(5));

        assert_eq!(other.local_time(), LocalTime::from_secs(15));
    }
}
