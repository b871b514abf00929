// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mergeable metric aggregates and their identity.

use crate::constants::APDEX_TOLERATING_FACTOR;
use serde::ser::{Serialize, SerializeTuple, Serializer};
use std::fmt;

/// Identity of a metric: a name plus an optional transaction scope.
///
/// Names are owned rather than interned: scopes derive from request URLs,
/// and a key must be freed with the window that holds it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub name: String,
    pub scope: Option<String>,
}

impl MetricKey {
    pub fn new(name: &str, scope: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            scope: scope.map(str::to_string),
        }
    }

    pub fn unscoped(name: &str) -> Self {
        Self::new(name, None)
    }

    pub fn scoped(name: &str, scope: &str) -> Self {
        Self::new(name, Some(scope))
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{} [{}]", self.name, scope),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Timing summary for one metric over a window.
///
/// All times are in seconds. `call_count == 0` implies every other field is
/// zero, and once a sample is recorded `min <= sample <= max` holds for every
/// sample. [`Stats::merge`] is associative and commutative, so partial
/// aggregates can be combined in any order.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Stats {
    pub call_count: u64,
    pub total: f64,
    pub total_exclusive: f64,
    pub min: f64,
    pub max: f64,
    pub sum_of_squares: f64,
}

impl Stats {
    pub fn from_sample(duration: f64, exclusive: f64) -> Self {
        let mut stats = Self::default();
        stats.record(duration, exclusive);
        stats
    }

    pub fn record(&mut self, duration: f64, exclusive: f64) {
        if self.call_count == 0 {
            self.min = duration;
            self.max = duration;
        } else {
            self.min = self.min.min(duration);
            self.max = self.max.max(duration);
        }
        self.call_count += 1;
        self.total += duration;
        self.total_exclusive += exclusive;
        self.sum_of_squares += duration * duration;
    }

    /// Counts an occurrence without timing, e.g. an error.
    pub fn increment_call_count(&mut self) {
        self.call_count += 1;
    }

    pub fn merge(&mut self, other: &Stats) {
        if other.call_count == 0 {
            return;
        }
        if self.call_count == 0 {
            *self = *other;
            return;
        }
        self.call_count += other.call_count;
        self.total += other.total;
        self.total_exclusive += other.total_exclusive;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum_of_squares += other.sum_of_squares;
    }

    pub fn is_empty(&self) -> bool {
        self.call_count == 0
    }
}

/// Wire form: `[count, total, exclusive, min, max, sum_of_squares]`.
impl Serialize for Stats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(6)?;
        #[allow(clippy::cast_precision_loss)]
        tuple.serialize_element(&(self.call_count as f64))?;
        tuple.serialize_element(&self.total)?;
        tuple.serialize_element(&self.total_exclusive)?;
        tuple.serialize_element(&self.min)?;
        tuple.serialize_element(&self.max)?;
        tuple.serialize_element(&self.sum_of_squares)?;
        tuple.end()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApdexZone {
    Satisfying,
    Tolerating,
    Frustrating,
}

impl ApdexZone {
    /// Classifies a duration (seconds) against the threshold `apdex_t`.
    pub fn classify(duration: f64, apdex_t: f64) -> Self {
        if duration <= apdex_t {
            ApdexZone::Satisfying
        } else if duration <= apdex_t * APDEX_TOLERATING_FACTOR {
            ApdexZone::Tolerating
        } else {
            ApdexZone::Frustrating
        }
    }
}

/// Apdex counts plus the range of thresholds they were classified with.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ApdexStats {
    pub satisfying: u64,
    pub tolerating: u64,
    pub frustrating: u64,
    pub min_apdex_t: f64,
    pub max_apdex_t: f64,
}

impl ApdexStats {
    pub fn record(&mut self, zone: ApdexZone, apdex_t: f64) {
        if self.count() == 0 {
            self.min_apdex_t = apdex_t;
            self.max_apdex_t = apdex_t;
        } else {
            self.min_apdex_t = self.min_apdex_t.min(apdex_t);
            self.max_apdex_t = self.max_apdex_t.max(apdex_t);
        }
        match zone {
            ApdexZone::Satisfying => self.satisfying += 1,
            ApdexZone::Tolerating => self.tolerating += 1,
            ApdexZone::Frustrating => self.frustrating += 1,
        }
    }

    pub fn merge(&mut self, other: &ApdexStats) {
        if other.count() == 0 {
            return;
        }
        if self.count() == 0 {
            *self = *other;
            return;
        }
        self.satisfying += other.satisfying;
        self.tolerating += other.tolerating;
        self.frustrating += other.frustrating;
        self.min_apdex_t = self.min_apdex_t.min(other.min_apdex_t);
        self.max_apdex_t = self.max_apdex_t.max(other.max_apdex_t);
    }

    pub fn count(&self) -> u64 {
        self.satisfying + self.tolerating + self.frustrating
    }
}

/// Wire form shares the six-slot stats layout:
/// `[satisfying, tolerating, frustrating, min apdexT, max apdexT, 0]`.
#[allow(clippy::cast_precision_loss)]
impl Serialize for ApdexStats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(6)?;
        tuple.serialize_element(&(self.satisfying as f64))?;
        tuple.serialize_element(&(self.tolerating as f64))?;
        tuple.serialize_element(&(self.frustrating as f64))?;
        tuple.serialize_element(&self.min_apdex_t)?;
        tuple.serialize_element(&self.max_apdex_t)?;
        tuple.serialize_element(&0.0_f64)?;
        tuple.end()
    }
}
