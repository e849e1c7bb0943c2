// Copyright 2025 The Drasi Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Sliding-window circuit breaker on reconnect frequency.
//!
//! Keeps the failures of the trailing minute. More than `max` of them means
//! something is structurally broken and looping on reconnects is pointless;
//! a deployment with widely spaced faults never trips it.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{FaultKind, ProxyError};

/// Width of the window failures are counted in.
pub const RETRY_WINDOW: Duration = Duration::from_secs(60);

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub at: Instant,
    pub kind: FaultKind,
    pub message: String,
}

#[derive(Debug)]
pub struct RetryFrequencyGuard {
    max: usize,
    records: VecDeque<FailureRecord>,
}

impl RetryFrequencyGuard {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            records: VecDeque::new(),
        }
    }

    /// Records a failure observed now.
    pub fn record(&mut self, kind: FaultKind, message: impl Into<String>) {
        self.record_at(Instant::now(), kind, message);
    }

    /// Records a failure at `at` and drops everything older than
    /// [`RETRY_WINDOW`] relative to the newest record.
    pub fn record_at(&mut self, at: Instant, kind: FaultKind, message: impl Into<String>) {
        // Keep the sequence sorted even if a caller hands us a stale instant.
        let at = match self.records.back() {
            Some(last) if last.at > at => last.at,
            _ => at,
        };
        self.records.push_back(FailureRecord {
            at,
            kind,
            message: message.into(),
        });

        while let Some(oldest) = self.records.front() {
            if at.duration_since(oldest.at) > RETRY_WINDOW {
                self.records.pop_front();
            } else {
                break;
            }
        }
    }

    /// Fails with [`ProxyError::FrequencyExceeded`] while the window holds
    /// more than `max` failures. Zero or one failure never trips.
    pub fn check(&self) -> Result<(), ProxyError> {
        if self.records.len() <= 1 || self.records.len() <= self.max {
            return Ok(());
        }
        Err(ProxyError::FrequencyExceeded {
            count: self.records.len(),
            max: self.max,
            history: self.history(),
        })
    }

    pub fn history(&self) -> Vec<FailureRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_trips_on_fourth_failure_within_window() {
        let mut guard = RetryFrequencyGuard::new(3);
        let t0 = Instant::now();

        for i in 0..3u64 {
            guard.record_at(t0 + secs(i * 3), FaultKind::Network, "refused");
            assert!(guard.check().is_ok(), "failure {} should not trip", i + 1);
        }

        guard.record_at(t0 + secs(9), FaultKind::Timeout, "no connack");
        match guard.check() {
            Err(ProxyError::FrequencyExceeded {
                count,
                max,
                history,
            }) => {
                assert_eq!(count, 4);
                assert_eq!(max, 3);
                assert_eq!(history.len(), 4);
                assert_eq!(history[3].kind, FaultKind::Timeout);
            }
            other => panic!("expected FrequencyExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_signals_on_every_check_while_condition_holds() {
        let mut guard = RetryFrequencyGuard::new(1);
        let t0 = Instant::now();
        guard.record_at(t0, FaultKind::Network, "a");
        guard.record_at(t0 + secs(1), FaultKind::Network, "b");

        assert!(guard.check().is_err());
        assert!(guard.check().is_err());
    }

    #[test]
    fn test_spread_out_failures_never_trip() {
        let mut guard = RetryFrequencyGuard::new(3);
        let t0 = Instant::now();
        for i in 0..20u64 {
            guard.record_at(t0 + secs(i * 61), FaultKind::Protocol, "bad packet");
            assert!(guard.check().is_ok());
            assert_eq!(guard.len(), 1);
        }
    }

    #[test]
    fn test_single_failure_never_trips() {
        let mut guard = RetryFrequencyGuard::new(1);
        assert!(guard.check().is_ok());
        guard.record(FaultKind::Other, "boom");
        assert!(guard.check().is_ok());
    }

    #[test]
    fn test_prunes_relative_to_newest_record() {
        let mut guard = RetryFrequencyGuard::new(10);
        let t0 = Instant::now();
        guard.record_at(t0, FaultKind::Network, "a");
        guard.record_at(t0 + secs(30), FaultKind::Network, "b");
        guard.record_at(t0 + secs(60), FaultKind::Network, "c");
        // exactly 60s old is still inside the window
        assert_eq!(guard.len(), 3);

        guard.record_at(t0 + secs(61), FaultKind::Network, "d");
        let history = guard.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].message, "b");
    }

    #[test]
    fn test_history_stays_sorted() {
        let mut guard = RetryFrequencyGuard::new(10);
        let t0 = Instant::now();
        guard.record_at(t0 + secs(5), FaultKind::Network, "late");
        guard.record_at(t0, FaultKind::Network, "stale");

        let history = guard.history();
        assert!(history.windows(2).all(|w| w[0].at <= w[1].at));
    }
}
