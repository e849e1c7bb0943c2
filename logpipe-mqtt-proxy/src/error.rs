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

//! Error taxonomy for the connection proxy.
//!
//! [`WireError`] is what a wire client raises. [`ProxyError`] is what the
//! proxy surfaces to the plugins sitting on top of it.

use std::fmt;

use thiserror::Error;

use crate::frequency::FailureRecord;

/// Classification of a transient fault, used for logging and for the
/// failure history kept by the retry-frequency guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Malformed or unexpected wire-protocol response.
    Protocol,
    /// No response within the client's time budget.
    Timeout,
    /// Connection refused, reset, DNS failure and friends.
    Network,
    /// Anything else the wire client reports.
    Other,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::Protocol => "protocol",
            FaultKind::Timeout => "timeout",
            FaultKind::Network => "network",
            FaultKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Errors raised by a [`WireClient`](crate::client::WireClient).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("network error: {0}")]
    Network(String),
    /// Raised by `publish` when the link has already dropped underneath it.
    #[error("client is not connected")]
    NotConnected,
    #[error("{0}")]
    Other(String),
}

impl WireError {
    /// Fault class used when this error enters the reconnect path.
    ///
    /// `NotConnected` only reaches the reconnect path when a background
    /// activity reports it, which means the link is gone.
    pub fn kind(&self) -> FaultKind {
        match self {
            WireError::Protocol(_) => FaultKind::Protocol,
            WireError::Timeout(_) => FaultKind::Timeout,
            WireError::Network(_) | WireError::NotConnected => FaultKind::Network,
            WireError::Other(_) => FaultKind::Other,
        }
    }
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => WireError::Timeout(e.to_string()),
            _ => WireError::Network(e.to_string()),
        }
    }
}

/// Errors surfaced by the [`ConnectionProxy`](crate::proxy::ConnectionProxy).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    #[error("retry frequency threshold exceeded: {count} failures within the last minute (max {max})")]
    FrequencyExceeded {
        count: usize,
        max: usize,
        history: Vec<FailureRecord>,
    },
    #[error("connection retries exhausted after {max_retries} rotations over {hosts:?}")]
    RotationExhausted { hosts: Vec<String>, max_retries: u32 },
    #[error("mqtt client is not connected")]
    NotConnected,
    #[error("publish failed ({kind}): {message}")]
    Publish { kind: FaultKind, message: String },
    #[error("invalid publish topic '{0}'")]
    InvalidTopic(String),
    #[error("failed to encode payload: {0}")]
    Encode(String),
    #[error("proxy already started")]
    AlreadyStarted,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("proxy task failed: {0}")]
    Internal(String),
}

impl ProxyError {
    /// True when the proxy has stopped retrying and the caller should give up.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::FrequencyExceeded { .. } | ProxyError::RotationExhausted { .. }
        )
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_error_kinds() {
        assert_eq!(WireError::Protocol("x".into()).kind(), FaultKind::Protocol);
        assert_eq!(WireError::Timeout("x".into()).kind(), FaultKind::Timeout);
        assert_eq!(WireError::Network("x".into()).kind(), FaultKind::Network);
        assert_eq!(WireError::NotConnected.kind(), FaultKind::Network);
        assert_eq!(WireError::Other("x".into()).kind(), FaultKind::Other);
    }

    #[test]
    fn test_io_error_conversion() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(WireError::from(refused), WireError::Network(_)));

        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(WireError::from(timed_out), WireError::Timeout(_)));
    }

    #[test]
    fn test_fatal_classification() {
        let exceeded = ProxyError::FrequencyExceeded {
            count: 11,
            max: 10,
            history: vec![],
        };
        let exhausted = ProxyError::RotationExhausted {
            hosts: vec!["h1".into()],
            max_retries: 1,
        };
        assert!(exceeded.is_fatal());
        assert!(exhausted.is_fatal());
        assert!(!ProxyError::NotConnected.is_fatal());
        assert!(!ProxyError::InvalidTopic("a/#".into()).is_fatal());
        assert!(!ProxyError::Publish {
            kind: FaultKind::Network,
            message: "reset".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = ProxyError::Publish {
            kind: FaultKind::Timeout,
            message: "no puback".into(),
        };
        assert_eq!(err.to_string(), "publish failed (timeout): no puback");
    }
}
