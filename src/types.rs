//! # Identity and Time Types
//!
//! This module defines the keys that identify features, procedures, data
//! streams and observations, plus the time primitives they are indexed by.
//!
//! ## Design Philosophy: Newtypes and Sentinels
//!
//! - [`FeatureId`] pairs a dense process-local `internal_id` with a globally
//!   stable `unique_id` (URI). Either may be missing, never both.
//! - [`FeatureKey`] adds a `valid_start_time`: one key per version of a
//!   feature. `Timestamp::MIN` means "valid since the beginning of time";
//!   `Timestamp::MAX` is the *latest version* marker, used only in queries and
//!   never stored.
//! - [`ObsKey`] identifies one observation by procedure, feature of interest,
//!   phenomenon time and result time.
//!
//! ## Invariants
//!
//! - A valid [`FeatureId`] has `internal_id > 0` or a non-empty `unique_id`
//! - A unique id, once assigned, never changes
//! - An [`ObsKey`] result time defaults to its phenomenon time

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::builder::Draft;
use crate::error::{Error, Result};

// =============================================================================
// Time
// =============================================================================

/// An instant on the UTC time line.
pub type Timestamp = DateTime<Utc>;

/// Earliest representable instant ("beginning of time").
pub const TIME_MIN: Timestamp = DateTime::<Utc>::MIN_UTC;

/// Latest representable instant ("end of time", or "latest version" in keys).
pub const TIME_MAX: Timestamp = DateTime::<Utc>::MAX_UTC;

/// A closed time period `[begin, end]`.
///
/// Unbounded ends use [`TIME_MIN`] / [`TIME_MAX`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeExtent {
    begin: Timestamp,
    end: Timestamp,
}

impl TimeExtent {
    /// Creates a period. Fails if `begin > end`.
    pub fn new(begin: Timestamp, end: Timestamp) -> Result<Self> {
        if begin > end {
            return Err(Error::validation(format!(
                "time extent begins after it ends: {} > {}",
                begin, end
            )));
        }
        Ok(Self { begin, end })
    }

    /// A zero-length period at `t`.
    pub fn instant(t: Timestamp) -> Self {
        Self { begin: t, end: t }
    }

    /// The whole time line.
    pub fn all_times() -> Self {
        Self {
            begin: TIME_MIN,
            end: TIME_MAX,
        }
    }

    /// A period starting at `begin` that never ends.
    pub fn beginning_at(begin: Timestamp) -> Self {
        Self {
            begin,
            end: TIME_MAX,
        }
    }

    pub fn begin(&self) -> Timestamp {
        self.begin
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    pub fn is_instant(&self) -> bool {
        self.begin == self.end
    }

    pub fn is_all_times(&self) -> bool {
        self.begin == TIME_MIN && self.end == TIME_MAX
    }

    pub fn contains(&self, t: Timestamp) -> bool {
        self.begin <= t && t <= self.end
    }

    pub fn contains_extent(&self, other: &TimeExtent) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    pub fn intersects(&self, other: &TimeExtent) -> bool {
        self.begin <= other.end && other.begin <= self.end
    }

    /// Smallest period covering both.
    pub fn union(&self, other: &TimeExtent) -> TimeExtent {
        TimeExtent {
            begin: self.begin.min(other.begin),
            end: self.end.max(other.end),
        }
    }

    /// Grows the period to include `t`.
    pub fn extend_to(&mut self, t: Timestamp) {
        if t < self.begin {
            self.begin = t;
        }
        if t > self.end {
            self.end = t;
        }
    }
}

impl fmt::Display for TimeExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |t: Timestamp| {
            if t == TIME_MIN {
                "-inf".to_string()
            } else if t == TIME_MAX {
                "+inf".to_string()
            } else {
                t.to_rfc3339()
            }
        };
        write!(f, "[{}, {}]", show(self.begin), show(self.end))
    }
}

// =============================================================================
// Feature Identity
// =============================================================================

/// Identity of a feature (procedure, feature of interest, sampling feature).
///
/// # Rust Pattern: const sentinels
///
/// `String::new()` is a `const fn`, so the sentinels below are true
/// constants usable in patterns and static defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeatureId {
    internal_id: u64,
    unique_id: String,
}

impl FeatureId {
    /// "No feature" sentinel (e.g. observations without a feature of interest).
    pub const NONE: FeatureId = FeatureId {
        internal_id: 0,
        unique_id: String::new(),
    };

    /// "All features" sentinel used by aggregated statistics.
    pub const ALL: FeatureId = FeatureId {
        internal_id: u64::MAX,
        unique_id: String::new(),
    };

    /// Creates an id. Use [`validate`](Self::validate) to check the invariant.
    pub fn new(internal_id: u64, unique_id: impl Into<String>) -> Self {
        Self {
            internal_id,
            unique_id: unique_id.into(),
        }
    }

    /// An id known only by its internal id.
    pub fn from_internal(internal_id: u64) -> Self {
        Self {
            internal_id,
            unique_id: String::new(),
        }
    }

    pub fn internal_id(&self) -> u64 {
        self.internal_id
    }

    /// The unique id, or `None` if not assigned yet.
    pub fn unique_id(&self) -> Option<&str> {
        if self.unique_id.is_empty() {
            None
        } else {
            Some(&self.unique_id)
        }
    }

    /// Sets the unique id. It can only be set once.
    pub fn assign_unique_id(&mut self, unique_id: impl Into<String>) -> Result<()> {
        if !self.unique_id.is_empty() {
            return Err(Error::validation(format!(
                "unique id already assigned: {}",
                self.unique_id
            )));
        }
        self.unique_id = unique_id.into();
        Ok(())
    }

    pub fn is_none(&self) -> bool {
        self.internal_id == 0 && self.unique_id.is_empty()
    }

    /// At least one of internal id or unique id must be present.
    pub fn validate(&self) -> Result<()> {
        if self.internal_id == 0 && self.unique_id.is_empty() {
            return Err(Error::validation(
                "feature id needs an internal id > 0 or a unique id",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unique_id() {
            Some(uid) => write!(f, "{} ({})", uid, self.internal_id),
            None => write!(f, "#{}", self.internal_id),
        }
    }
}

/// Identity of one version of a feature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeatureKey {
    id: FeatureId,
    valid_start_time: Timestamp,
}

impl FeatureKey {
    /// "No feature of interest" sentinel.
    pub const NO_FOI: FeatureKey = FeatureKey {
        id: FeatureId::NONE,
        valid_start_time: TIME_MIN,
    };

    /// Starts a builder.
    pub fn builder() -> FeatureKeyBuilder {
        FeatureKeyBuilder {
            draft: Draft::new(
                "FeatureKey",
                FeatureKey {
                    id: FeatureId::NONE,
                    valid_start_time: TIME_MIN,
                },
            ),
        }
    }

    /// Key of the version of `id` valid since `valid_start_time`.
    pub fn new(id: FeatureId, valid_start_time: Timestamp) -> Self {
        Self {
            id,
            valid_start_time,
        }
    }

    /// Query key resolving to the latest version of `id`.
    pub fn latest(id: FeatureId) -> Self {
        Self {
            id,
            valid_start_time: TIME_MAX,
        }
    }

    pub fn id(&self) -> &FeatureId {
        &self.id
    }

    pub fn internal_id(&self) -> u64 {
        self.id.internal_id
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.id.unique_id()
    }

    pub fn valid_start_time(&self) -> Timestamp {
        self.valid_start_time
    }

    /// Whether this is a query key for the latest version.
    pub fn is_latest(&self) -> bool {
        self.valid_start_time == TIME_MAX
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_latest() {
            write!(f, "{}@latest", self.id)
        } else if self.valid_start_time == TIME_MIN {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{}@{}", self.id, self.valid_start_time.to_rfc3339())
        }
    }
}

/// Builder for [`FeatureKey`].
#[derive(Debug)]
pub struct FeatureKeyBuilder {
    draft: Draft<FeatureKey>,
}

impl FeatureKeyBuilder {
    pub fn internal_id(&mut self, internal_id: u64) -> &mut Self {
        self.draft.edit(|k| k.id.internal_id = internal_id);
        self
    }

    pub fn unique_id(&mut self, unique_id: impl Into<String>) -> &mut Self {
        let unique_id = unique_id.into();
        self.draft.edit(|k| k.id.unique_id = unique_id);
        self
    }

    pub fn valid_start_time(&mut self, t: Timestamp) -> &mut Self {
        self.draft.edit(|k| k.valid_start_time = t);
        self
    }

    /// Marks the key as a latest-version query key.
    pub fn latest_version(&mut self) -> &mut Self {
        self.valid_start_time(TIME_MAX)
    }

    pub fn build(&mut self) -> Result<FeatureKey> {
        let key = self.draft.take()?;
        key.id.validate()?;
        Ok(key)
    }
}

// =============================================================================
// Data Stream Identity
// =============================================================================

/// Internal id of a data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataStreamKey(u64);

impl DataStreamKey {
    /// Creates a key from a raw id. Panics if zero in debug builds.
    pub fn from_raw(value: u64) -> Self {
        debug_assert!(value > 0, "DataStreamKey must be > 0");
        Self(value)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DataStreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ds#{}", self.0)
    }
}

// =============================================================================
// Observation Identity
// =============================================================================

/// Identity of one observation.
///
/// Ordering compares procedure, then feature of interest, then phenomenon
/// time, then result time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObsKey {
    procedure_key: FeatureKey,
    foi_key: FeatureKey,
    phenomenon_time: Timestamp,
    result_time: Timestamp,
}

impl ObsKey {
    pub fn builder() -> ObsKeyBuilder {
        ObsKeyBuilder {
            draft: Draft::new("ObsKey", PartialObsKey::default()),
        }
    }

    pub fn procedure_key(&self) -> &FeatureKey {
        &self.procedure_key
    }

    pub fn foi_key(&self) -> &FeatureKey {
        &self.foi_key
    }

    pub fn phenomenon_time(&self) -> Timestamp {
        self.phenomenon_time
    }

    /// Result time; equals the phenomenon time when none was given.
    pub fn result_time(&self) -> Timestamp {
        self.result_time
    }

    pub fn has_foi(&self) -> bool {
        !self.foi_key.id.is_none()
    }
}

impl fmt::Display for ObsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "obs({}, {}, {})",
            self.procedure_key,
            self.foi_key,
            self.phenomenon_time.to_rfc3339()
        )
    }
}

#[derive(Debug, Default)]
struct PartialObsKey {
    procedure_key: Option<FeatureKey>,
    foi_key: Option<FeatureKey>,
    phenomenon_time: Option<Timestamp>,
    result_time: Option<Timestamp>,
}

/// Builder for [`ObsKey`].
#[derive(Debug)]
pub struct ObsKeyBuilder {
    draft: Draft<PartialObsKey>,
}

impl ObsKeyBuilder {
    pub fn procedure_key(&mut self, key: FeatureKey) -> &mut Self {
        self.draft.edit(|k| k.procedure_key = Some(key));
        self
    }

    pub fn foi_key(&mut self, key: FeatureKey) -> &mut Self {
        self.draft.edit(|k| k.foi_key = Some(key));
        self
    }

    pub fn phenomenon_time(&mut self, t: Timestamp) -> &mut Self {
        self.draft.edit(|k| k.phenomenon_time = Some(t));
        self
    }

    pub fn result_time(&mut self, t: Timestamp) -> &mut Self {
        self.draft.edit(|k| k.result_time = Some(t));
        self
    }

    pub fn build(&mut self) -> Result<ObsKey> {
        let partial = self.draft.take()?;
        let procedure_key = partial
            .procedure_key
            .ok_or_else(|| Error::validation("obs key needs a procedure key"))?;
        procedure_key.id.validate()?;
        let phenomenon_time = partial
            .phenomenon_time
            .ok_or_else(|| Error::validation("obs key needs a phenomenon time"))?;
        Ok(ObsKey {
            procedure_key,
            foi_key: partial.foi_key.unwrap_or(FeatureKey::NO_FOI),
            phenomenon_time,
            result_time: partial.result_time.unwrap_or(phenomenon_time),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
