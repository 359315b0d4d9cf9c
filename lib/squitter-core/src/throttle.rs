//! Per-aircraft rate limiting.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::{
    collections::FastHashMap,
    record::{Record, TransmissionType},
};

/// Default idle horizon after which throttle entries are evicted.
pub const DEFAULT_IDLE_HORIZON: Duration = Duration::from_secs(600);

// Indexed by transmission type value; slot zero is unused.
const CLASS_SLOTS: usize = 9;

/// Minimum interval between accepted records, per throttle class.
///
/// Only canonical classes carry an interval. Lookups for an aliased transmission type resolve to the interval of its
/// canonical class, and a class with no interval configured is not throttled beyond exact duplicates.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TtlTable {
    ttls: [Duration; CLASS_SLOTS],
}

impl TtlTable {
    /// Creates an empty table.
    pub fn empty() -> Self {
        Self {
            ttls: [Duration::ZERO; CLASS_SLOTS],
        }
    }

    /// Sets the interval for the class that the given transmission type is throttled as.
    pub fn set(&mut self, tt: TransmissionType, ttl: Duration) {
        self.ttls[usize::from(tt.throttle_alias().as_u8())] = ttl;
    }

    /// Sets the interval for the class that the given transmission type is throttled as.
    pub fn with_ttl(mut self, tt: TransmissionType, ttl: Duration) -> Self {
        self.set(tt, ttl);
        self
    }

    /// Returns the interval for the given transmission type.
    pub fn get(&self, tt: TransmissionType) -> Duration {
        self.ttls[usize::from(tt.throttle_alias().as_u8())]
    }

    /// Returns the largest interval in the table.
    pub fn max_ttl(&self) -> Duration {
        self.ttls.iter().copied().max().unwrap_or_default()
    }
}

impl Default for TtlTable {
    fn default() -> Self {
        Self::empty()
            .with_ttl(TransmissionType::IdentificationAndCategory, Duration::from_secs(1))
            .with_ttl(TransmissionType::SurfacePosition, Duration::from_secs(1))
            .with_ttl(TransmissionType::AirborneVelocity, Duration::from_secs(5))
            .with_ttl(TransmissionType::SurveillanceAltitude, Duration::from_secs(10))
            .with_ttl(TransmissionType::SurveillanceId, Duration::from_secs(1))
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
struct ThrottleKey {
    icao_address: u32,
    class: TransmissionType,
}

/// Limits how often records of the same class are accepted for the same aircraft.
///
/// A record is rejected if an earlier record of the same class, for the same aircraft, was accepted no more than the
/// class interval ago. Rejected records do not extend the interval. Multilateration sources produce few enough records
/// that a throttle in bypass mode accepts everything and keeps no state.
#[derive(Debug)]
pub struct Throttle {
    ttls: TtlTable,
    bypass: bool,
    idle_horizon: Duration,
    last_accepted: FastHashMap<ThrottleKey, Instant>,
    next_eviction: Option<Instant>,
}

impl Throttle {
    /// Creates a new `Throttle` with the given intervals.
    pub fn new(ttls: TtlTable) -> Self {
        Self {
            ttls,
            bypass: false,
            idle_horizon: DEFAULT_IDLE_HORIZON,
            last_accepted: FastHashMap::default(),
            next_eviction: None,
        }
    }

    /// Sets whether the throttle is bypassed.
    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    /// Sets the idle horizon after which entries are evicted.
    ///
    /// The effective horizon is never shorter than the largest interval, so eviction cannot change whether a record is
    /// accepted.
    pub fn with_idle_horizon(mut self, idle_horizon: Duration) -> Self {
        self.idle_horizon = idle_horizon;
        self
    }

    /// Returns the effective eviction horizon.
    pub fn eviction_horizon(&self) -> Duration {
        self.idle_horizon.max(self.ttls.max_ttl())
    }

    /// Returns the number of tracked entries.
    pub fn len(&self) -> usize {
        self.last_accepted.len()
    }

    /// Returns `true` if no entries are tracked.
    pub fn is_empty(&self) -> bool {
        self.last_accepted.is_empty()
    }

    /// Returns `true` if the record should be accepted, recording the acceptance.
    pub fn accept(&mut self, record: &Record) -> bool {
        self.accept_at(record.icao_address, record.transmission_type, Instant::now())
    }

    /// Returns `true` if a record of the given type for the given aircraft should be accepted at `now`, recording the
    /// acceptance.
    pub fn accept_at(&mut self, icao_address: u32, tt: TransmissionType, now: Instant) -> bool {
        if self.bypass {
            return true;
        }

        let key = ThrottleKey {
            icao_address,
            class: tt.throttle_alias(),
        };

        if let Some(last) = self.last_accepted.get(&key) {
            if now.saturating_duration_since(*last) <= self.ttls.get(tt) {
                return false;
            }
        }

        self.last_accepted.insert(key, now);
        true
    }

    /// Evicts entries whose last acceptance is older than the eviction horizon, returning how many were evicted.
    pub fn evict_idle(&mut self, now: Instant) -> usize {
        let horizon = self.eviction_horizon();
        let before = self.last_accepted.len();
        self.last_accepted
            .retain(|_, last| now.saturating_duration_since(*last) <= horizon);

        let evicted = before - self.last_accepted.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.last_accepted.len(), "Evicted idle throttle entries.");
        }
        evicted
    }

    /// Evicts idle entries if at least one eviction horizon has passed since the last eviction.
    pub fn maybe_evict(&mut self, now: Instant) -> usize {
        let horizon = self.eviction_horizon();
        match self.next_eviction {
            None => {
                self.next_eviction = Some(now + horizon);
                0
            }
            Some(due) if now >= due => {
                self.next_eviction = Some(now + horizon);
                self.evict_idle(now)
            }
            Some(_) => 0,
        }
    }
}
