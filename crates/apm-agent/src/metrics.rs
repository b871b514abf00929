// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metrics collection for one harvest window.
//!
//! A collection is never cleared in place. The agent swaps a fresh one in at
//! harvest time and ships the old one, and each transaction fills a private
//! collection that is merged whole into the live one when it ends.

use crate::metric::{ApdexStats, ApdexZone, MetricKey, Stats};
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use std::time::SystemTime;

#[derive(Clone, Debug)]
pub struct Metrics {
    apdex_t: f64,
    started: SystemTime,
    stats: HashMap<MetricKey, Stats, FnvBuildHasher>,
    apdex: HashMap<MetricKey, ApdexStats, FnvBuildHasher>,
}

impl Metrics {
    pub fn new(apdex_t: f64) -> Self {
        Self {
            apdex_t,
            started: SystemTime::now(),
            stats: HashMap::default(),
            apdex: HashMap::default(),
        }
    }

    pub fn apdex_t(&self) -> f64 {
        self.apdex_t
    }

    /// Changes the threshold used for transactions classified from now on.
    /// Already recorded apdex counts are left as they are.
    pub fn set_apdex_t(&mut self, apdex_t: f64) {
        self.apdex_t = apdex_t;
    }

    pub fn started(&self) -> SystemTime {
        self.started
    }

    /// Records one sample (seconds) under `name` and optional `scope`.
    pub fn measure(&mut self, name: &str, scope: Option<&str>, duration: f64, exclusive: f64) {
        self.measure_key(MetricKey::new(name, scope), duration, exclusive);
    }

    pub fn measure_key(&mut self, key: MetricKey, duration: f64, exclusive: f64) {
        self.stats.entry(key).or_default().record(duration, exclusive);
    }

    pub fn increment(&mut self, name: &str, scope: Option<&str>) {
        self.stats
            .entry(MetricKey::new(name, scope))
            .or_default()
            .increment_call_count();
    }

    /// Classifies `duration` (seconds) with this collection's current apdexT.
    pub fn measure_apdex(&mut self, name: &str, duration: f64, frustrated: bool) {
        let zone = if frustrated {
            ApdexZone::Frustrating
        } else {
            ApdexZone::classify(duration, self.apdex_t)
        };
        let apdex_t = self.apdex_t;
        self.apdex
            .entry(MetricKey::unscoped(name))
            .or_default()
            .record(zone, apdex_t);
    }

    pub fn get(&self, name: &str, scope: Option<&str>) -> Option<&Stats> {
        self.stats.get(&MetricKey::new(name, scope))
    }

    pub fn get_apdex(&self, name: &str) -> Option<&ApdexStats> {
        self.apdex.get(&MetricKey::unscoped(name))
    }

    /// Merges every aggregate of `other` into this collection.
    pub fn merge(&mut self, other: &Metrics) {
        for (key, stats) in &other.stats {
            self.stats.entry(key.clone()).or_default().merge(stats);
        }
        for (key, apdex) in &other.apdex {
            self.apdex.entry(key.clone()).or_default().merge(apdex);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetricKey, &Stats)> {
        self.stats.iter()
    }

    pub fn iter_apdex(&self) -> impl Iterator<Item = (&MetricKey, &ApdexStats)> {
        self.apdex.iter()
    }

    pub fn len(&self) -> usize {
        self.stats.len() + self.apdex.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty() && self.apdex.is_empty()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_APDEX_T)
    }
}
