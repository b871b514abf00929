// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Reported to the collector during the handshake.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AGENT_LANGUAGE: &str = "rust";

/// Collector protocol revision spoken by [`crate::collector::http::HttpCollector`].
pub const PROTOCOL_VERSION: u32 = 14;

pub const DEFAULT_COLLECTOR_HOST: &str = "collector.example.com";
pub const DEFAULT_COLLECTOR_PORT: u16 = 443;

/// Default harvest cycle.
pub const DEFAULT_HARVEST_INTERVAL: Duration = Duration::from_secs(60);

/// Timeout applied to each collector RPC.
pub const DEFAULT_COLLECTOR_TIMEOUT: Duration = Duration::from_secs(30);

/// Apdex threshold in seconds used until the collector pushes one.
pub const DEFAULT_APDEX_T: f64 = 0.1;

/// Transactions up to `APDEX_TOLERATING_FACTOR * apdexT` are tolerating.
pub const APDEX_TOLERATING_FACTOR: f64 = 4.0;

/// Traced errors kept per harvest; extras are counted and dropped.
pub const MAX_TRACED_ERRORS: usize = 20;

/// Slow traces kept per harvest.
pub const DEFAULT_TOP_N_TRACES: usize = 1;

/// Capacity of the connection notice channel.
pub const NOTICE_CHANNEL_SIZE: usize = 64;

pub const ROOT_SEGMENT_NAME: &str = "ROOT";

/// Scope recorded for errors noticed outside of any transaction.
pub const UNKNOWN_SCOPE: &str = "Unknown";

/// Reconnect delays in seconds, indexed by consecutive failures. The last
/// entry is the cap and is reported at warning level.
pub const BACKOFF_INTERVALS_SECS: [u64; 6] = [15, 15, 30, 60, 120, 300];

/// Consecutive connection failures tolerated before giving up.
pub const RETRY_BUDGET: u32 = BACKOFF_INTERVALS_SECS.len() as u32;
