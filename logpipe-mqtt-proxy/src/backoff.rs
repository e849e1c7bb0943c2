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

//! Geometric reconnect backoff.

use std::time::Duration;

/// Tracks the delay before the next reconnect attempt.
///
/// The delay starts at `initial`, is multiplied by `ratio` after each
/// failure and saturates at `max`. [`Backoff::reset`] is called on every
/// successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    ratio: u32,
    current: Duration,
}

impl Backoff {
    /// Callers validate `initial <= max` and `ratio >= 1` up front
    /// (see [`ProxyConfig::validate`](crate::config::ProxyConfig::validate)).
    pub fn new(initial: Duration, max: Duration, ratio: u32) -> Self {
        Self {
            initial,
            max,
            ratio,
            current: initial,
        }
    }

    /// Returns the current interval and advances to the next one.
    pub fn next_interval(&mut self) -> Duration {
        let interval = self.current;
        self.current = self
            .current
            .checked_mul(self.ratio)
            .map_or(self.max, |next| next.min(self.max));
        interval
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}
