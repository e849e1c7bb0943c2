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

//! Reconnecting MQTT connection proxy for the logpipe MQTT plugins.
//!
//! The proxy owns the broker connection of one plugin instance. It detects
//! broken links, reconnects with geometric backoff capped at a maximum,
//! gives up when failures become too frequent, and fails over across a list
//! of brokers with a bounded retry budget.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use logpipe_mqtt_proxy::{Activity, ConnectionHook, ConnectionProxy, ProxyConfig, RumqttConnector, Session, WireError};
//!
//! struct Idle;
//!
//! #[async_trait::async_trait]
//! impl ConnectionHook for Idle {
//!     async fn on_connected(&self, session: Session) -> Result<Activity, WireError> {
//!         Ok(Activity::spawn(async move { session.receive(|_| {}).await }))
//!     }
//! }
//!
//! let config = ProxyConfig::builder("broker.local").backoff(1, 2, 60).build();
//! let proxy = ConnectionProxy::builder("mqtt-out", config, Arc::new(RumqttConnector::new())).build()?;
//! proxy.start(Idle).await?;
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod delay;
pub mod error;
pub mod frequency;
pub mod hook;
pub mod hosts;
pub mod proxy;
pub mod rumqtt;
pub mod testing;

pub use backoff::Backoff;
pub use client::{valid_publish_topic, Connector, InboundMessage, WireClient};
pub use config::{
    parse_qos, ConnectionOptions, Credentials, ProxyConfig, ProxyConfigBuilder, SecurityConfig,
    TlsConfig, TlsOptions,
};
pub use delay::{Delay, TokioDelay};
pub use error::{FaultKind, ProxyError, ProxyResult, WireError};
pub use frequency::{FailureRecord, RetryFrequencyGuard};
pub use hook::{Activity, ConnectionHook, Session};
pub use hosts::HostSelector;
pub use proxy::{ConnectionProxy, ConnectionProxyBuilder, ProxyState};
pub use rumqtt::{RumqttClient, RumqttConnector};

pub use rumqttc::QoS;
