// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::{BACKOFF_INTERVALS_SECS, RETRY_BUDGET};
use std::time::Duration;

/// Delay before the next connection attempt and how loudly to report it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub interval: Duration,
    /// The schedule reached its cap.
    pub warn: bool,
    /// The retry budget is spent; the connection must not be retried.
    pub error: bool,
}

impl Backoff {
    pub const ZERO: Backoff = Backoff {
        interval: Duration::ZERO,
        warn: false,
        error: false,
    };

    /// Backoff after `failures` previous consecutive failures. Non-decreasing
    /// in `failures`.
    pub fn for_failures(failures: u32) -> Self {
        let last = BACKOFF_INTERVALS_SECS.len() - 1;
        match usize::try_from(failures) {
            Ok(index) if failures < RETRY_BUDGET => Backoff {
                interval: Duration::from_secs(BACKOFF_INTERVALS_SECS[index]),
                warn: index == last,
                error: false,
            },
            _ => Backoff {
                interval: Duration::from_secs(BACKOFF_INTERVALS_SECS[last]),
                warn: false,
                error: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_waits_fifteen_seconds() {
        assert_eq!(
            Backoff::for_failures(0),
            Backoff {
                interval: Duration::from_secs(15),
                warn: false,
                error: false,
            }
        );
    }

    #[test]
    fn schedule_grows_to_a_warned_cap() {
        let intervals: Vec<u64> = (0..6)
            .map(|failures| Backoff::for_failures(failures).interval.as_secs())
            .collect();
        assert_eq!(intervals, vec![15, 15, 30, 60, 120, 300]);
        assert!(Backoff::for_failures(5).warn);
        assert!(!Backoff::for_failures(4).warn);
    }

    #[test]
    fn budget_exhausted_after_six_failures() {
        let backoff = Backoff::for_failures(6);
        assert_eq!(backoff.interval, Duration::from_secs(300));
        assert!(!backoff.warn);
        assert!(backoff.error);
        assert_eq!(Backoff::for_failures(u32::MAX), backoff);
    }

    #[test]
    fn schedule_is_non_decreasing() {
        let mut previous = Duration::ZERO;
        for failures in 0..20 {
            let interval = Backoff::for_failures(failures).interval;
            assert!(interval >= previous);
            previous = interval;
        }
    }
}
