//! # tw-core — The "Atoms" of TRACKWELL
//!
//! A metric series is an unordered stream of samples. Clients retry, batch
//! out of order, and log from several workers at once, so "the current value"
//! of a series has to be decided by the samples themselves, not by arrival.
//!
//! The [`MetricPoint`] carries that decision: a manual [`Ord`] on
//! `(step, timestamp, value)` that every writer applies the same way.

#![no_std]

use core::cmp::Ordering;

/// Lifecycle stage of an archived (soft-deleted) run or experiment.
pub const LIFECYCLE_DELETED: &str = "deleted";
/// Lifecycle stage of a live run or experiment.
pub const LIFECYCLE_ACTIVE: &str = "active";

/// Run status values accepted by the tracking API.
pub const RUN_STATUSES: [&str; 5] = ["RUNNING", "SCHEDULED", "FINISHED", "FAILED", "KILLED"];
pub const STATUS_RUNNING: &str = "RUNNING";

/// Wire sentinels. JSON has no NaN or Infinity, so clients send strings.
pub const SENTINEL_NAN: &str = "NaN";
pub const SENTINEL_POS_INF: &str = "Infinity";
pub const SENTINEL_NEG_INF: &str = "-Infinity";

/// One sample of a metric series, reduced to the fields that decide
/// which sample is "latest".
///
/// # Ordering Key
///
/// Points are ordered by `(step, timestamp, value)`. A point supersedes
/// another only if its step is strictly greater, or steps tie and its
/// timestamp is strictly greater, or both tie and its value is strictly
/// greater. Values compare with [`f64::total_cmp`] so the order is total
/// even for values that slipped past sentinel mapping.
///
/// `is_nan` is NOT part of the key: a NaN sample is stored as `value = 0.0`
/// with the flag set, and ranks as zero.
#[derive(Debug, Clone, Copy)]
pub struct MetricPoint {
    pub value: f64,
    pub is_nan: bool,
    pub step: i64,
    pub timestamp: i64,
}

// =============================================================================
// Manual Ord on (step, timestamp, value)
// =============================================================================

impl Ord for MetricPoint {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.step
            .cmp(&other.step)
            .then(self.timestamp.cmp(&other.timestamp))
            .then(self.value.total_cmp(&other.value))
    }
}

impl PartialOrd for MetricPoint {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MetricPoint {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MetricPoint {}

impl MetricPoint {
    #[inline]
    pub const fn new(value: f64, step: i64, timestamp: i64) -> Self {
        Self {
            value,
            is_nan: false,
            step,
            timestamp,
        }
    }

    /// A NaN sample as stored: zero value, flag set.
    #[inline]
    pub const fn nan(step: i64, timestamp: i64) -> Self {
        Self {
            value: 0.0,
            is_nan: true,
            step,
            timestamp,
        }
    }

    /// Build a point from a decoded wire value.
    #[inline]
    pub const fn from_wire(value: WireValue, step: i64, timestamp: i64) -> Self {
        Self {
            value: value.value,
            is_nan: value.is_nan,
            step,
            timestamp,
        }
    }

    /// True if `self` strictly wins over `current` under the ordering key.
    #[inline]
    pub fn supersedes(&self, current: &Self) -> bool {
        self.cmp(current) == Ordering::Greater
    }
}

/// Fold a sequence of points into its winner. `None` for an empty sequence.
///
/// Ties keep the earlier point; since ties compare equal on every key
/// field, the result is the same for any input order.
pub fn latest_of<I>(points: I) -> Option<MetricPoint>
where
    I: IntoIterator<Item = MetricPoint>,
{
    points.into_iter().fold(None, |best, p| match best {
        Some(b) if !p.supersedes(&b) => Some(b),
        _ => Some(p),
    })
}

// =============================================================================
// Sentinel mapping
// =============================================================================

/// A metric value after sentinel mapping: always finite, NaN carried as a flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WireValue {
    pub value: f64,
    pub is_nan: bool,
}

impl WireValue {
    /// Map a finite number, clamping non-finite input the same way the
    /// string sentinels are mapped.
    #[inline]
    pub fn from_f64(v: f64) -> Self {
        if v.is_nan() {
            Self {
                value: 0.0,
                is_nan: true,
            }
        } else if v == f64::INFINITY {
            Self {
                value: f64::MAX,
                is_nan: false,
            }
        } else if v == f64::NEG_INFINITY {
            Self {
                value: -f64::MAX,
                is_nan: false,
            }
        } else {
            Self {
                value: v,
                is_nan: false,
            }
        }
    }

    /// Map one of the three wire sentinels. `None` for any other string.
    pub fn from_sentinel(s: &str) -> Option<Self> {
        match s {
            SENTINEL_NAN => Some(Self {
                value: 0.0,
                is_nan: true,
            }),
            SENTINEL_POS_INF => Some(Self {
                value: f64::MAX,
                is_nan: false,
            }),
            SENTINEL_NEG_INF => Some(Self {
                value: -f64::MAX,
                is_nan: false,
            }),
            _ => None,
        }
    }
}
