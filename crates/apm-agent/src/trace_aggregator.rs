// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Selection of the slowest transaction traces for one harvest.

use crate::constants::APDEX_TOLERATING_FACTOR;
use crate::trace::TraceNode;
use crate::transaction::Transaction;
use serde::ser::{Serialize, SerializeTuple, Serializer};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

#[derive(Clone, Debug, PartialEq)]
pub struct TransactionTrace {
    pub start_time: SystemTime,
    pub duration: Duration,
    pub scope: String,
    pub url: String,
    pub root: TraceNode,
    pub guid: String,
}

impl TransactionTrace {
    pub fn new(transaction: &Transaction, scope: &str) -> Self {
        let trace = transaction.trace();
        Self {
            start_time: trace.start_time(),
            duration: transaction.duration(),
            scope: scope.to_string(),
            url: transaction.path().to_string(),
            root: trace.to_node(scope),
            guid: format!("{:016x}", transaction.id()),
        }
    }
}

/// Wire form: `[start_ms, duration_ms, scope, url, [root_node], guid]`.
impl Serialize for TransactionTrace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let start_ms = self
            .start_time
            .duration_since(UNIX_EPOCH)
            .map(millis)
            .unwrap_or_default();
        let mut tuple = serializer.serialize_tuple(6)?;
        tuple.serialize_element(&start_ms)?;
        tuple.serialize_element(&millis(self.duration))?;
        tuple.serialize_element(&self.scope)?;
        tuple.serialize_element(&self.url)?;
        tuple.serialize_element(&[&self.root])?;
        tuple.serialize_element(&self.guid)?;
        tuple.end()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Clone, Debug)]
pub struct TraceAggregator {
    top_n: usize,
    threshold: Option<Duration>,
    traces: Vec<TransactionTrace>,
}

impl TraceAggregator {
    /// `threshold` defaults to four times the apdexT current at offer time.
    pub fn new(top_n: usize, threshold: Option<Duration>) -> Self {
        Self {
            top_n,
            threshold,
            traces: Vec::with_capacity(top_n),
        }
    }

    /// Keeps the trace of `transaction` if it is among the slowest seen so
    /// far. Only one trace is kept per scope.
    pub fn offer(&mut self, transaction: &Transaction, scope: &str, apdex_t: f64) -> bool {
        if self.top_n == 0 {
            return false;
        }
        let duration = transaction.duration();
        let threshold = self.threshold.unwrap_or_else(|| {
            Duration::try_from_secs_f64(apdex_t * APDEX_TOLERATING_FACTOR).unwrap_or_default()
        });
        if duration < threshold {
            return false;
        }

        let slot = if let Some(index) = self.traces.iter().position(|t| t.scope == scope) {
            if self.traces[index].duration >= duration {
                return false;
            }
            Some(index)
        } else if self.traces.len() < self.top_n {
            None
        } else {
            let Some((index, fastest)) = self
                .traces
                .iter()
                .enumerate()
                .min_by_key(|(_, trace)| trace.duration)
            else {
                return false;
            };
            if fastest.duration >= duration {
                return false;
            }
            Some(index)
        };

        let trace = TransactionTrace::new(transaction, scope);
        debug!("Keeping {:?} trace for {scope}", trace.duration);
        match slot {
            Some(index) => self.traces[index] = trace,
            None => self.traces.push(trace),
        }
        true
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Drains the selection, slowest first.
    pub fn take(&mut self) -> Vec<TransactionTrace> {
        let mut traces = std::mem::take(&mut self.traces);
        traces.sort_by(|a, b| b.duration.cmp(&a.duration));
        traces
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(id: u64, url: &str, millis: u64) -> Transaction {
        let mut transaction = Transaction::web(id, url);
        let root = transaction.trace().root();
        transaction
            .trace_mut()
            .set_timing(root, Duration::ZERO, Duration::from_millis(millis));
        transaction.end();
        transaction
    }

    #[test]
    fn fast_transactions_are_not_kept() {
        let mut aggregator = TraceAggregator::new(1, None);
        assert!(!aggregator.offer(&finished(1, "/a", 100), "WebTransaction/Uri/a", 0.1));
        assert!(aggregator.offer(&finished(2, "/a", 500), "WebTransaction/Uri/a", 0.1));
        assert_eq!(aggregator.len(), 1);
    }

    #[test]
    fn keeps_the_slowest() {
        let mut aggregator = TraceAggregator::new(1, Some(Duration::ZERO));
        aggregator.offer(&finished(1, "/a", 10), "WebTransaction/Uri/a", 0.1);
        assert!(aggregator.offer(&finished(2, "/b", 30), "WebTransaction/Uri/b", 0.1));
        assert!(!aggregator.offer(&finished(3, "/c", 20), "WebTransaction/Uri/c", 0.1));

        let traces = aggregator.take();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].scope, "WebTransaction/Uri/b");
        assert!(aggregator.is_empty());
    }

    #[test]
    fn one_trace_per_scope() {
        let mut aggregator = TraceAggregator::new(3, Some(Duration::ZERO));
        aggregator.offer(&finished(1, "/a", 10), "WebTransaction/Uri/a", 0.1);
        assert!(aggregator.offer(&finished(2, "/a", 50), "WebTransaction/Uri/a", 0.1));
        assert!(!aggregator.offer(&finished(3, "/a", 20), "WebTransaction/Uri/a", 0.1));
        aggregator.offer(&finished(4, "/b", 5), "WebTransaction/Uri/b", 0.1);

        let traces = aggregator.take();
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].duration, Duration::from_millis(50));
        assert_eq!(traces[0].guid, format!("{:016x}", 2));
    }

    #[test]
    fn encodes_trace_tuple() {
        let mut aggregator = TraceAggregator::new(1, Some(Duration::ZERO));
        aggregator.offer(&finished(255, "/a?x=1", 40), "WebTransaction/Uri/a", 0.1);
        let mut trace = aggregator.take().remove(0);
        trace.start_time = UNIX_EPOCH + Duration::from_secs(2);

        assert_eq!(
            serde_json::to_value(&trace).expect("serialize"),
            serde_json::json!([
                2000, 40, "WebTransaction/Uri/a", "/a",
                [[0, 40, "ROOT", {}, [[0, 40, "WebTransaction/Uri/a", {}, []]]]],
                "00000000000000ff"
            ])
        );
    }
}
