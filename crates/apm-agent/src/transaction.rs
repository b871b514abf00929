// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transactions and the execution context that carries them.
//!
//! There is no ambient "current transaction". Instrumentation holds a
//! [`TransactionContext`] and moves it across every callback, timer or
//! continuation it schedules; the context exclusively owns the active
//! [`Transaction`].

use crate::error_aggregator::NoticedError;
use crate::metrics::Metrics;
use crate::recorder::Recorder;
use crate::trace::{SegmentId, Trace};
use derive_more::Display;
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    #[display("web")]
    Web,
    #[display("background")]
    Background,
}

#[derive(Clone, Debug)]
pub struct Transaction {
    id: u64,
    kind: TransactionKind,
    /// Request URL for web transactions, the job name otherwise.
    name: String,
    status_code: Option<u16>,
    trace: Trace,
    current: SegmentId,
    errors: Vec<NoticedError>,
}

impl Transaction {
    pub fn new(id: u64, kind: TransactionKind, name: impl Into<String>) -> Self {
        let trace = Trace::new();
        let current = trace.root();
        Self {
            id,
            kind,
            name: name.into(),
            status_code: None,
            trace,
            current,
            errors: Vec::new(),
        }
    }

    pub fn web(id: u64, url: impl Into<String>) -> Self {
        Self::new(id, TransactionKind::Web, url)
    }

    pub fn background(id: u64, name: impl Into<String>) -> Self {
        Self::new(id, TransactionKind::Background, name)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn is_web(&self) -> bool {
        self.kind == TransactionKind::Web
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The URL without its query string.
    pub fn path(&self) -> &str {
        match self.name.split_once('?') {
            Some((path, _)) => path,
            None => &self.name,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    pub fn set_status_code(&mut self, status_code: u16) {
        self.status_code = Some(status_code);
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn trace_mut(&mut self) -> &mut Trace {
        &mut self.trace
    }

    pub fn current_segment(&self) -> SegmentId {
        self.current
    }

    pub fn errors(&self) -> &[NoticedError] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<NoticedError> {
        std::mem::take(&mut self.errors)
    }

    pub fn duration(&self) -> Duration {
        self.trace.duration()
    }

    /// Opens a segment under the current one and makes it current.
    pub fn begin_segment(
        &mut self,
        name: impl Into<String>,
        recorder: Option<Recorder>,
    ) -> SegmentId {
        let id = self.trace.add(self.current, name, recorder);
        self.current = id;
        id
    }

    /// Ends a segment. The current segment moves to its nearest open ancestor.
    pub fn end_segment(&mut self, id: SegmentId) {
        self.trace.end_segment(id);
        if id != self.current {
            return;
        }
        let mut parent = self.trace.segment(id).and_then(|segment| segment.parent());
        while let Some(candidate) = parent {
            match self.trace.segment(candidate) {
                Some(segment) if segment.is_finished() && candidate != self.trace.root() => {
                    parent = segment.parent();
                }
                _ => break,
            }
        }
        self.current = parent.unwrap_or_else(|| self.trace.root());
    }

    pub fn notice_error(&mut self, error: NoticedError) {
        self.errors.push(error);
    }

    /// Whether the transaction counts as an error: an explicitly noticed
    /// error, or a web response status of 400 or above other than 404.
    pub fn is_error(&self) -> bool {
        if !self.errors.is_empty() {
            return true;
        }
        self.is_web()
            && self
                .status_code
                .is_some_and(|status| status >= 400 && status != 404)
    }

    pub fn end(&mut self) {
        self.trace.end();
    }

    pub fn is_ended(&self) -> bool {
        self.trace.is_ended()
    }

    /// Rolls every segment with a recorder and the transaction itself up
    /// into `metrics`. `scope` is the transaction's metric name, when known.
    pub fn record_metrics(&self, scope: Option<&str>, metrics: &mut Metrics) {
        for (id, segment) in self.trace.segments() {
            if let Some(recorder) = segment.recorder() {
                recorder.record(self.trace.timing(id), scope, self.kind, metrics);
            }
        }

        let Some(scope) = scope else {
            debug!("Transaction {} has no scope, skipping rollups", self.id);
            return;
        };
        let duration = self.duration().as_secs_f64();
        let exclusive = self
            .trace
            .exclusive_duration(self.trace.root())
            .as_secs_f64();
        match self.kind {
            TransactionKind::Web => {
                metrics.measure("WebTransaction", None, duration, exclusive);
                metrics.measure("HttpDispatcher", None, duration, exclusive);
            }
            TransactionKind::Background => {
                metrics.measure("OtherTransaction/all", None, duration, exclusive);
            }
        }
        metrics.measure(scope, None, duration, exclusive);

        if self.is_error() {
            metrics.increment("Errors/all", None);
            metrics.increment(&format!("Errors/{scope}"), None);
        }
    }

    /// Classifies the web transaction with the apdexT current in `metrics`.
    pub fn record_apdex(&self, scope: &str, metrics: &mut Metrics) {
        if !self.is_web() {
            return;
        }
        let duration = self.duration().as_secs_f64();
        let frustrated = self.is_error();
        metrics.measure_apdex("Apdex", duration, frustrated);
        let name = scope.strip_prefix("WebTransaction/").unwrap_or(scope);
        metrics.measure_apdex(&format!("Apdex/{name}"), duration, frustrated);
    }
}

/// Explicit execution context carrying the active transaction, if any.
///
/// Every call is a no-op without an active transaction, so instrumentation
/// can use it unconditionally.
#[derive(Debug, Default)]
pub struct TransactionContext {
    active: Option<Transaction>,
}

impl TransactionContext {
    pub fn new(transaction: Transaction) -> Self {
        Self {
            active: Some(transaction),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn active_transaction(&self) -> Option<&Transaction> {
        self.active.as_ref()
    }

    pub fn active_transaction_mut(&mut self) -> Option<&mut Transaction> {
        self.active.as_mut()
    }

    pub fn begin_segment(
        &mut self,
        name: impl Into<String>,
        recorder: Option<Recorder>,
    ) -> Option<SegmentId> {
        let transaction = self.active.as_mut()?;
        Some(transaction.begin_segment(name, recorder))
    }

    pub fn end_segment(&mut self, id: SegmentId) {
        if let Some(transaction) = self.active.as_mut() {
            transaction.end_segment(id);
        }
    }

    pub fn set_status_code(&mut self, status_code: u16) {
        if let Some(transaction) = self.active.as_mut() {
            transaction.set_status_code(status_code);
        }
    }

    /// Attaches an error to the active transaction. Returns the error back
    /// when there is none, so the caller can report it unscoped.
    pub fn notice_error(&mut self, error: NoticedError) -> Option<NoticedError> {
        match self.active.as_mut() {
            Some(transaction) => {
                transaction.notice_error(error);
                None
            }
            None => Some(error),
        }
    }

    /// Ends and releases the active transaction.
    pub fn finish(&mut self) -> Option<Transaction> {
        let mut transaction = self.active.take()?;
        transaction.end();
        Some(transaction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCOPE: &str = "OtherTransaction/jobs/sync";

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn nested_segments_roll_up_exclusive_time() {
        let mut context = TransactionContext::new(Transaction::background(1, "jobs/sync"));
        let parent = context
            .begin_segment(
                "MongoDB/users/find",
                Some(Recorder::datastore("MongoDB", "users", "find")),
            )
            .expect("active transaction");
        let child1 = context
            .begin_segment(
                "MongoDB/users/insert",
                Some(Recorder::datastore("MongoDB", "users", "insert")),
            )
            .expect("active transaction");
        let child2 = context
            .begin_segment(
                "MongoDB/cache/update",
                Some(Recorder::datastore("MongoDB", "cache", "update")),
            )
            .expect("active transaction");

        let transaction = context.active_transaction_mut().expect("active");
        let root = transaction.trace().root();
        let trace = transaction.trace_mut();
        trace.set_timing(root, ms(0), ms(26));
        trace.set_timing(parent, ms(0), ms(26));
        trace.set_timing(child1, ms(3), ms(12));
        trace.set_timing(child2, ms(10), ms(8));

        let transaction = context.finish().expect("finished");
        let mut metrics = Metrics::new(0.1);
        transaction.record_metrics(Some(SCOPE), &mut metrics);

        let all_other = metrics.get("Database/allOther", None).expect("rollup");
        assert_eq!(all_other.call_count, 3);
        assert_close(all_other.total, 0.046);
        assert_close(all_other.total_exclusive, 0.029);

        let operations = [
            "Database/users/find",
            "Database/users/insert",
            "Database/cache/update",
        ];
        let per_operation: f64 = operations
            .iter()
            .map(|name| metrics.get(name, None).expect("operation").total_exclusive)
            .sum();
        assert_close(per_operation, all_other.total_exclusive);
        assert_close(
            metrics
                .get("Database/users/find", None)
                .expect("find")
                .total_exclusive,
            0.014,
        );

        assert!(metrics.get("Database/allWeb", None).is_none());
        assert_eq!(
            metrics.get("OtherTransaction/all", None).map(|s| s.call_count),
            Some(1)
        );
        assert_close(metrics.get(SCOPE, None).expect("scope").total, 0.026);
    }

    #[test]
    fn end_segment_restores_parent_as_current() {
        let mut transaction = Transaction::web(1, "/users");
        let root = transaction.trace().root();
        let outer = transaction.begin_segment("outer", None);
        let inner = transaction.begin_segment("inner", None);
        assert_eq!(transaction.current_segment(), inner);

        transaction.end_segment(inner);
        assert_eq!(transaction.current_segment(), outer);
        transaction.end_segment(outer);
        assert_eq!(transaction.current_segment(), root);
    }

    #[test]
    fn web_rollups_and_errors() {
        let mut transaction = Transaction::web(2, "/users/1?verbose=true");
        transaction.set_status_code(500);
        let root = transaction.trace().root();
        transaction.trace_mut().set_timing(root, ms(0), ms(200));
        transaction.end();

        let scope = "WebTransaction/Uri/users/1";
        let mut metrics = Metrics::new(0.1);
        transaction.record_metrics(Some(scope), &mut metrics);
        transaction.record_apdex(scope, &mut metrics);

        assert_eq!(transaction.path(), "/users/1");
        for name in ["WebTransaction", "HttpDispatcher", scope] {
            assert_close(metrics.get(name, None).expect(name).total, 0.2);
        }
        assert_eq!(metrics.get("Errors/all", None).map(|s| s.call_count), Some(1));
        assert_eq!(
            metrics
                .get(&format!("Errors/{scope}"), None)
                .map(|s| s.call_count),
            Some(1)
        );
        let apdex = metrics.get_apdex("Apdex/Uri/users/1").expect("apdex");
        assert_eq!(apdex.frustrating, 1);
    }

    #[test]
    fn not_found_is_not_an_error() {
        let mut transaction = Transaction::web(3, "/missing");
        transaction.set_status_code(404);
        assert!(!transaction.is_error());
        transaction.set_status_code(403);
        assert!(transaction.is_error());
    }

    #[test]
    fn background_transactions_have_no_apdex() {
        let mut transaction = Transaction::background(4, "jobs/sync");
        transaction.end();
        let mut metrics = Metrics::new(0.1);
        transaction.record_apdex(SCOPE, &mut metrics);
        assert!(metrics.get_apdex("Apdex").is_none());
    }

    #[test]
    fn empty_context_ignores_instrumentation() {
        let mut context = TransactionContext::empty();
        assert!(context.begin_segment("orphan", None).is_none());
        context.set_status_code(200);
        let error = NoticedError::new("boom", "RuntimeError");
        assert_eq!(context.notice_error(error.clone()), Some(error));
        assert!(context.finish().is_none());
    }

    #[test]
    fn missing_scope_records_segments_only() {
        let mut transaction = Transaction::web(5, "/x");
        let id = transaction.begin_segment("Custom/work", Some(Recorder::generic("Custom/work")));
        transaction.end_segment(id);
        transaction.end();

        let mut metrics = Metrics::new(0.1);
        transaction.record_metrics(None, &mut metrics);
        assert_eq!(metrics.len(), 1);
        assert!(metrics.get("Custom/work", None).is_some());
    }
}
