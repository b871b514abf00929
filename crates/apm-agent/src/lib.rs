// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process performance monitoring agent.
//!
//! Instrumentation opens segments on the active transaction carried by an
//! [`transaction::TransactionContext`]. When a transaction ends its segment tree
//! is rolled up into scoped metrics, merged into the agent's live
//! [`metrics::Metrics`] collection, and offered to the slow-trace and error
//! aggregators. The [`agent::AgentService`] keeps a session with the remote
//! collector and ships everything on a fixed harvest interval.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod collector;
pub mod config;
pub mod constants;
pub mod error_aggregator;
pub mod errors;
pub mod mapper;
pub mod metric;
pub mod metrics;
pub mod normalizer;
pub mod recorder;
pub mod trace;
pub mod trace_aggregator;
pub mod transaction;
