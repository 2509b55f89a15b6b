//! Hybrid logical clock used to stamp policy versions.
//!
//! A stamp is the last observed wall time plus a logical counter, at
//! microsecond resolution. The counter goes back to zero whenever the wall
//! clock moves past the last observed time, which is the usual hybrid logical
//! clock reset; between wall ticks `update`, observed stamps and same-tick
//! calls to `now` bump it. Stamps handed out by one clock are strictly
//! increasing, and observing a peer's stamp guarantees every later local stamp
//! is greater than it, unless the peer runs further ahead of the wall clock
//! than the drift tolerance allows.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::HLC_CLOCK_DRIFT;
use crate::error::ClockError;

const MICROS_PER_SEC: f64 = 1_000_000.0;

/// Source of physical time in microseconds since the Unix epoch.
pub trait WallClock: Send + Sync {
    fn now_micros(&self) -> u64;

    /// Wall time in fractional seconds.
    fn now_secs(&self) -> f64 {
        self.now_micros() as f64 / MICROS_PER_SEC
    }
}

/// Operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    #[allow(clippy::cast_possible_truncation)] // microseconds fit u64 for the next 500k years
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// A policy version: an HLC stamp in seconds since the Unix epoch.
///
/// On the wire a version is a JSON number of seconds. The received value is
/// kept exactly, so two peers' stamps compare the same on every node no
/// matter how finely their clocks resolve. Local stamps are whole
/// microseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct Version(f64);

impl Version {
    pub fn from_micros(micros: u64) -> Self {
        Self(micros as f64 / MICROS_PER_SEC)
    }

    /// Nearest whole microsecond.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn as_micros(self) -> u64 {
        (self.0 * MICROS_PER_SEC).round() as u64
    }

    /// Smallest whole microsecond not below this version.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn ceil_micros(self) -> u64 {
        (self.0 * MICROS_PER_SEC).ceil() as u64
    }

    /// Negative and non-finite inputs are rejected.
    pub fn from_secs_f64(secs: f64) -> Option<Self> {
        if !(secs.is_finite() && secs >= 0.0) {
            return None;
        }
        // -0.0 and 0.0 must share one ordering slot
        Some(Self(if secs == 0.0 { 0.0 } else { secs }))
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.0)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Self::from_secs_f64(secs)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid version {secs}")))
    }
}

#[derive(Debug)]
struct ClockState {
    /// Last observed wall time.
    physical: u64,
    /// Tie breaker added on top of `physical`.
    logical: u64,
    /// Greatest stamp issued or observed so far.
    last: u64,
}

/// Hybrid logical clock.
pub struct HybridLogicalClock {
    wall: Arc<dyn WallClock>,
    drift: Duration,
    state: Mutex<ClockState>,
}

impl fmt::Debug for HybridLogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridLogicalClock")
            .field("drift", &self.drift)
            .finish_non_exhaustive()
    }
}

impl Default for HybridLogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HybridLogicalClock {
    /// Clock over the system wall clock with the default drift tolerance.
    pub fn new() -> Self {
        Self::with_wall_clock(Arc::new(SystemClock), HLC_CLOCK_DRIFT)
    }

    pub fn with_wall_clock(wall: Arc<dyn WallClock>, drift: Duration) -> Self {
        let physical = wall.now_micros();
        Self {
            wall,
            drift,
            state: Mutex::new(ClockState {
                physical,
                logical: 0,
                last: 0,
            }),
        }
    }

    pub fn drift_tolerance(&self) -> Duration {
        self.drift
    }

    /// Returns a stamp strictly greater than every stamp previously issued or observed.
    pub fn now(&self) -> Version {
        let wall = self.wall.now_micros();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if wall > state.physical {
            state.physical = wall;
            state.logical = 0;
        }

        let mut stamp = state.physical + state.logical;
        if stamp <= state.last {
            state.logical = state.last + 1 - state.physical;
            stamp = state.last + 1;
        }
        state.last = stamp;
        Version::from_micros(stamp)
    }

    /// Advances the logical counter by one tick.
    pub fn update(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.logical += 1;
    }

    /// Merges a stamp received from a peer.
    ///
    /// Stamps at or above the local physical time pull the clock forward so
    /// that the next local stamp dominates them. Stamps further ahead of the
    /// wall clock than the drift tolerance are rejected and leave the clock
    /// untouched.
    pub fn observe(&self, remote: Version) -> Result<(), ClockError> {
        let wall = self.wall.now_micros();
        let remote = remote.ceil_micros();
        let ahead = Duration::from_micros(remote.saturating_sub(wall));
        if ahead > self.drift {
            return Err(ClockError::FutureSkew {
                ahead,
                tolerance: self.drift,
            });
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if remote >= state.physical {
            state.physical = remote.max(wall);
            state.logical += 1;
        }
        state.last = state.last.max(remote);
        Ok(())
    }

    /// How far the most recent stamp runs ahead of the wall clock.
    pub fn drift(&self) -> Duration {
        let wall = self.wall.now_micros();
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let current = state.last.max(state.physical + state.logical);
        Duration::from_micros(current.saturating_sub(wall))
    }
}
