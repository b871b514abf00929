// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector-assigned numeric IDs for metric names.
//!
//! After each metric harvest the collector answers with
//! `[[{"name": ..., "scope": ...}, id], ...]`. Later payloads send the ID in
//! place of the name/scope pair. New mappings are merged into the existing
//! ones; a malformed response leaves the current mapping untouched.

use crate::errors::RuleError;
use crate::metric::MetricKey;
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct MappedName {
    name: String,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct MetricMapper {
    ids: HashMap<MetricKey, u64, FnvBuildHasher>,
}

impl MetricMapper {
    /// Merges a mapping response. Nothing is applied unless the whole
    /// response parses.
    pub fn load(&mut self, value: &Value) -> Result<usize, RuleError> {
        if value.is_null() {
            return Err(RuleError::Null);
        }
        let entries: Vec<(MappedName, u64)> = serde_json::from_value(value.clone())?;
        let added = entries.len();
        for (mapped, id) in entries {
            let scope = mapped.scope.as_deref().filter(|scope| !scope.is_empty());
            self.ids.insert(MetricKey::new(&mapped.name, scope), id);
        }
        debug!("Loaded {added} metric ids, {} total", self.ids.len());
        Ok(added)
    }

    pub fn map(&self, key: &MetricKey) -> Option<u64> {
        self.ids.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
