// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the agent.
//!
//! None of these ever reach instrumented application code. The tracing path
//! logs and drops failures; only the collector session and harvest cycle
//! surface them to their callers.

use thiserror::Error;

/// Failure of a single collector RPC.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// The collector asked the agent to reconnect with a fresh session.
    #[error("collector requested a restart: {0}")]
    ForceRestart(String),
    /// The collector asked the agent to stop reporting.
    #[error("collector requested a disconnect: {0}")]
    ForceDisconnect(String),
    /// Any other exception returned in the response envelope.
    #[error("collector raised {error_type}: {message}")]
    Exception { error_type: String, message: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The collector could not be reached for a reason not tied to the HTTP client.
    #[error("collector unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected status code {0}")]
    Status(u16),
    #[error("failed to decode collector response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid collector response: {0}")]
    InvalidResponse(String),
}

/// Failure of a connection attempt, consumed by the connection state machine.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("handshake failed: {0}")]
    Handshake(#[source] CollectorError),
    #[error("giving up after {0} consecutive connection failures")]
    RetryBudgetExhausted(u32),
    #[error("connection is {0}, cannot connect")]
    InvalidState(crate::collector::connection::ConnectionState),
}

/// Failure of a harvest cycle. The cycle's payload is discarded.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("not connected to the collector")]
    NotConnected,
    #[error("agent service is not running")]
    Stopped,
    #[error("failed to send {endpoint}: {source}")]
    Transport {
        endpoint: &'static str,
        #[source]
        source: CollectorError,
    },
}

/// A normalization rule set or ID mapping that cannot be used as received.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule set is not a list of rules: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("rule set is null")]
    Null,
    #[error("invalid match expression {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}
