// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Traced errors collected for one harvest.

use serde::ser::{Serialize, SerializeTuple, Serializer};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// An error as reported by instrumentation, before it is attributed to a scope.
#[derive(Clone, Debug, PartialEq)]
pub struct NoticedError {
    pub timestamp: SystemTime,
    pub message: String,
    pub error_type: String,
}

impl NoticedError {
    pub fn new(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            message: message.into(),
            error_type: error_type.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TracedError {
    pub timestamp: SystemTime,
    pub scope: String,
    pub message: String,
    pub error_type: String,
    pub params: Map<String, Value>,
}

impl TracedError {
    pub fn new(scope: impl Into<String>, error: NoticedError) -> Self {
        Self {
            timestamp: error.timestamp,
            scope: scope.into(),
            message: error.message,
            error_type: error.error_type,
            params: Map::new(),
        }
    }

    #[must_use]
    pub fn with_request_uri(mut self, uri: &str) -> Self {
        self.params
            .insert("request_uri".to_string(), Value::String(uri.to_string()));
        self
    }
}

/// Wire form: `[timestamp_ms, scope, message, error_type, params]`.
impl Serialize for TracedError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let timestamp_ms = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        let mut tuple = serializer.serialize_tuple(5)?;
        tuple.serialize_element(&timestamp_ms)?;
        tuple.serialize_element(&self.scope)?;
        tuple.serialize_element(&self.message)?;
        tuple.serialize_element(&self.error_type)?;
        tuple.serialize_element(&self.params)?;
        tuple.end()
    }
}

#[derive(Clone, Debug)]
pub struct ErrorAggregator {
    max_errors: usize,
    errors: Vec<TracedError>,
    seen: usize,
}

impl ErrorAggregator {
    pub fn new(max_errors: usize) -> Self {
        Self {
            max_errors,
            errors: Vec::new(),
            seen: 0,
        }
    }

    /// Stores the error while under the cap. Returns whether it was kept.
    pub fn add(&mut self, error: TracedError) -> bool {
        self.seen += 1;
        if self.errors.len() >= self.max_errors {
            debug!(
                "Error limit of {} reached, dropping {} error",
                self.max_errors, error.error_type
            );
            return false;
        }
        self.errors.push(error);
        true
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Every error seen since the last take, stored or not.
    pub fn error_count(&self) -> usize {
        self.seen
    }

    pub fn errors(&self) -> &[TracedError] {
        &self.errors
    }

    /// Drains the stored errors and resets the count.
    pub fn take(&mut self) -> Vec<TracedError> {
        self.seen = 0;
        std::mem::take(&mut self.errors)
    }
}

impl Default for ErrorAggregator {
    fn default() -> Self {
        Self::new(crate::constants::MAX_TRACED_ERRORS)
    }
}
