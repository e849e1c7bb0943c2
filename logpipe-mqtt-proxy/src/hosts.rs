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

//! Broker failover across a list of candidate hosts.

use crate::error::ProxyError;

/// Rotates through `ha_hosts` on failure, bounded by a retry budget.
///
/// The budget counts rotations since the last successful connect, so a
/// list of `L` hosts with `max_retries = r` allows `r + 1` attempts before
/// [`ProxyError::RotationExhausted`]. A single-host list still enforces the
/// budget.
#[derive(Debug, Clone)]
pub struct HostSelector {
    hosts: Vec<String>,
    index: usize,
    retries: u32,
    max_retries: u32,
}

impl HostSelector {
    /// Returns `None` for an empty list, which means failover is off.
    pub fn new(hosts: Vec<String>, max_retries: u32) -> Option<Self> {
        if hosts.is_empty() {
            return None;
        }
        Some(Self {
            hosts,
            index: 0,
            retries: 0,
            max_retries,
        })
    }

    pub fn current(&self) -> &str {
        &self.hosts[self.index]
    }

    /// Moves to the next host, wrapping around the list.
    pub fn advance(&mut self) -> Result<&str, ProxyError> {
        self.retries = self.retries.saturating_add(1);
        if self.retries > self.max_retries {
            return Err(ProxyError::RotationExhausted {
                hosts: self.hosts.clone(),
                max_retries: self.max_retries,
            });
        }
        self.index = (self.index + 1) % self.hosts.len();
        Ok(self.current())
    }

    /// Clears the retry budget but stays on the host that just worked.
    pub fn reset(&mut self) {
        self.retries = 0;
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }
}
