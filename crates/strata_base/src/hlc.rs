//! Hybrid-logical clock.
//!
//! Timestamps carry a wall-clock component (nanoseconds since the Unix
//! epoch) and a logical component used to break ties when the wall clock
//! does not advance between readings. The clock never moves backwards.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Default bound on clock skew between nodes.
pub const DEFAULT_MAX_OFFSET: Duration = Duration::from_millis(500);

/// A hybrid-logical timestamp. Ordered by `(wall_time, logical)`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Wall time in nanoseconds since the Unix epoch.
    pub wall_time: i64,
    /// Ties between equal wall times are broken by this counter.
    pub logical: i32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp {
        wall_time: 0,
        logical: 0,
    };

    pub fn new(wall_time: i64, logical: i32) -> Timestamp {
        Timestamp { wall_time, logical }
    }

    /// Builds a timestamp from a microsecond-precision wall time.
    pub fn from_wall_micros(micros: i64) -> Timestamp {
        Timestamp {
            wall_time: micros * 1_000,
            logical: 0,
        }
    }

    /// Wall time truncated to microseconds.
    pub fn wall_micros(&self) -> i64 {
        self.wall_time / 1_000
    }

    pub fn is_zero(&self) -> bool {
        *self == Timestamp::ZERO
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.wall_time, self.logical)
    }
}

/// Source of wall-clock readings, pluggable so tests can drive time by hand.
pub trait TimeSource: Send + Sync + 'static {
    fn now_nanos(&self) -> i64;
}

/// Wall clock backed by the operating system.
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_nanos(&self) -> i64 {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before the Unix epoch");
        elapsed.as_nanos().min(i64::MAX as u128) as i64
    }
}

/// Manually advanced wall clock for tests.
pub struct ManualTimeSource {
    nanos: AtomicI64,
}

impl ManualTimeSource {
    pub fn new(start_nanos: i64) -> ManualTimeSource {
        ManualTimeSource {
            nanos: AtomicI64::new(start_nanos),
        }
    }

    pub fn advance(&self, d: Duration) {
        self.nanos
            .fetch_add(d.as_nanos().min(i64::MAX as u128) as i64, Ordering::SeqCst);
    }

    pub fn set(&self, nanos: i64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_nanos(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

/// Monotonic hybrid-logical clock over a [`TimeSource`].
pub struct Clock {
    source: Arc<dyn TimeSource>,
    max_offset: Duration,
    latest: Mutex<Timestamp>,
}

impl Clock {
    pub fn new(source: Arc<dyn TimeSource>, max_offset: Duration) -> Clock {
        Clock {
            source,
            max_offset,
            latest: Mutex::new(Timestamp::ZERO),
        }
    }

    /// A clock over the operating-system wall clock with the default offset.
    pub fn system() -> Clock {
        Clock::new(Arc::new(SystemTimeSource), DEFAULT_MAX_OFFSET)
    }

    /// Returns a timestamp strictly greater than every previous reading.
    pub fn now(&self) -> Timestamp {
        let mut latest = self.latest.lock().expect("clock lock");
        let wall = self.source.now_nanos();
        if wall > latest.wall_time {
            *latest = Timestamp::new(wall, 0);
        } else {
            latest.logical += 1;
        }
        *latest
    }

    /// The current wall reading without updating the logical component.
    pub fn physical_now(&self) -> i64 {
        self.source.now_nanos()
    }

    pub fn max_offset(&self) -> Duration {
        self.max_offset
    }
}
