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

//! The MQTT client boundary the proxy drives.
//!
//! The proxy never speaks the wire protocol itself. It opens one
//! [`WireClient`] per connection attempt through a [`Connector`] and only
//! uses the operations below.

use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::QoS;

use crate::config::ConnectionOptions;
use crate::error::WireError;

/// An inbound application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// True for a topic a message can be published to: non-empty, no
/// wildcards, no NUL.
pub fn valid_publish_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(&['+', '#', '\0'][..])
}

/// One connection to a broker.
#[async_trait]
pub trait WireClient: Send + Sync {
    async fn connect(&self) -> Result<(), WireError>;

    /// Closes the connection. A no-op when already disconnected.
    async fn disconnect(&self) -> Result<(), WireError>;

    fn is_connected(&self) -> bool;

    async fn subscribe(&self, topics: &[String], qos: QoS) -> Result<(), WireError>;

    /// Fails with [`WireError::NotConnected`] when the link dropped before
    /// the request could be handed over.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        qos: QoS,
    ) -> Result<(), WireError>;

    /// Calls `handler` for each inbound message until the link breaks
    /// (returns the cause) or is closed.
    async fn receive(
        &self,
        handler: &mut (dyn FnMut(InboundMessage) + Send),
    ) -> Result<(), WireError>;
}

/// Opens fresh, not yet connected, wire clients.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, options: &ConnectionOptions) -> Arc<dyn WireClient>;
}
