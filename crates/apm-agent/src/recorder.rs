// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-segment metric recorders.
//!
//! A recorder turns one finished segment into a fixed fan-out of metric
//! contributions. The set of recorder kinds is closed; each kind carries the
//! operation data it needs and none of them can fail, including when the
//! transaction has no scope.

use crate::metric::MetricKey;
use crate::metrics::Metrics;
use crate::transaction::TransactionKind;

const UNKNOWN: &str = "unknown";

/// Timing of a finished segment, in seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SegmentTiming {
    pub duration: f64,
    pub exclusive: f64,
}

/// One sample destined for a metric.
#[derive(Clone, Debug, PartialEq)]
pub struct Contribution {
    pub key: MetricKey,
    pub duration: f64,
    pub exclusive: f64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recorder {
    /// Records the segment under a single name, scoped and unscoped.
    Generic { name: String },
    /// A datastore call, e.g. category `MongoDB`, model `users`, operation `find`.
    Datastore {
        category: String,
        model: String,
        operation: String,
    },
    /// An outbound call to another service.
    External { host: String, library: String },
}

impl Recorder {
    pub fn generic(name: impl Into<String>) -> Self {
        Recorder::Generic { name: name.into() }
    }

    pub fn datastore(
        category: impl Into<String>,
        model: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Recorder::Datastore {
            category: category.into(),
            model: model.into(),
            operation: operation.into(),
        }
    }

    pub fn external(host: impl Into<String>, library: impl Into<String>) -> Self {
        Recorder::External {
            host: host.into(),
            library: library.into(),
        }
    }

    /// Computes the metrics this segment contributes to.
    pub fn contributions(
        &self,
        timing: SegmentTiming,
        scope: Option<&str>,
        kind: TransactionKind,
    ) -> Vec<Contribution> {
        let mut out = Vec::with_capacity(7);
        let mut push = |name: &str, scope: Option<&str>| {
            out.push(Contribution {
                key: MetricKey::new(name, scope),
                duration: timing.duration,
                exclusive: timing.exclusive,
            });
        };

        match self {
            Recorder::Generic { name } => {
                let name = or_unknown(name);
                push(name, None);
                if let Some(scope) = scope {
                    push(name, Some(scope));
                }
            }
            Recorder::Datastore {
                category,
                model,
                operation,
            } => {
                let model = or_unknown(model);
                let operation = or_unknown(operation);
                let statement = format!("{}/{model}/{operation}", or_unknown(category));
                let database = format!("Database/{model}/{operation}");

                push(&statement, None);
                push(&database, None);
                push(&format!("Database/{operation}"), None);
                push(
                    match kind {
                        TransactionKind::Web => "Database/allWeb",
                        TransactionKind::Background => "Database/allOther",
                    },
                    None,
                );
                push("Database/all", None);
                if let Some(scope) = scope {
                    push(&statement, Some(scope));
                    push(&database, Some(scope));
                }
            }
            Recorder::External { host, library } => {
                let host = or_unknown(host);
                let call = format!("External/{host}/{}", or_unknown(library));

                push(&call, None);
                push(&format!("External/{host}/all"), None);
                push(
                    match kind {
                        TransactionKind::Web => "External/allWeb",
                        TransactionKind::Background => "External/allOther",
                    },
                    None,
                );
                push("External/all", None);
                if let Some(scope) = scope {
                    push(&call, Some(scope));
                }
            }
        }
        out
    }

    pub fn record(
        &self,
        timing: SegmentTiming,
        scope: Option<&str>,
        kind: TransactionKind,
        metrics: &mut Metrics,
    ) {
        for contribution in self.contributions(timing, scope, kind) {
            metrics.measure_key(contribution.key, contribution.duration, contribution.exclusive);
        }
    }
}

fn or_unknown(component: &str) -> &str {
    if component.is_empty() {
        UNKNOWN
    } else {
        component
    }
}
