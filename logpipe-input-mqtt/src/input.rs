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

//! MQTT input: subscribes through the connection proxy and forwards
//! every inbound message to an [`EventSink`].

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use logpipe_mqtt_proxy::{
    Activity, ConnectionHook, ConnectionProxy, Connector, Delay, InboundMessage, ProxyError,
    ProxyState, QoS, RumqttConnector, Session, TokioDelay, WireError,
};

use crate::config::MqttInputConfig;
use crate::mapper::{self, RecordParser};
use crate::sink::EventSink;

/// MQTT input plugin.
///
/// Subscriptions are renewed on every (re)connect, so a broker restart or a
/// failover to another HA host does not lose the topic filters.
pub struct MqttInput {
    config: MqttInputConfig,
    proxy: ConnectionProxy,
    sink: Arc<dyn EventSink>,
}

impl MqttInput {
    /// Create a new MQTT input backed by rumqttc.
    pub fn new(config: MqttInputConfig, sink: Arc<dyn EventSink>) -> Result<Self> {
        Self::with_runtime(
            config,
            sink,
            Arc::new(RumqttConnector::new()),
            Arc::new(TokioDelay),
        )
    }

    pub fn with_runtime(
        config: MqttInputConfig,
        sink: Arc<dyn EventSink>,
        connector: Arc<dyn Connector>,
        delay: Arc<dyn Delay>,
    ) -> Result<Self> {
        config.validate()?;
        let proxy = ConnectionProxy::builder(&config.id, config.proxy.clone(), connector)
            .delay(delay)
            .build()?;
        Ok(Self {
            config,
            proxy,
            sink,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &MqttInputConfig {
        &self.config
    }

    pub async fn start(&self) -> Result<()> {
        let topics = self.config.topic.filters();
        info!(
            "[{}] Starting MQTT input (broker={}:{}, topics={:?})",
            self.config.id, self.config.proxy.host, self.config.proxy.port, topics
        );

        let hook = SubscribeHook {
            id: self.config.id.clone(),
            topics,
            qos: self.config.subscription_qos()?,
            separator: self.config.bulk_separator().map(str::to_string),
            parser: self.config.record_parser(),
            sink: self.sink.clone(),
        };
        self.proxy.start(hook).await?;

        info!("[{}] MQTT input started", self.config.id);
        Ok(())
    }

    /// Stops the input. A fatal connection error that already ended the
    /// input is logged, not returned.
    pub async fn stop(&self) -> Result<()> {
        match self.proxy.shutdown().await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                warn!("[{}] MQTT input had stopped on error: {e}", self.config.id);
            }
            Err(e) => return Err(e.into()),
        }
        info!("[{}] MQTT input stopped", self.config.id);
        Ok(())
    }

    pub fn state(&self) -> ProxyState {
        self.proxy.state()
    }

    /// Resolves once the input has stopped, with the error that stopped it.
    pub async fn closed(&self) -> Option<ProxyError> {
        self.proxy.closed().await
    }
}

struct SubscribeHook {
    id: String,
    topics: Vec<String>,
    qos: QoS,
    separator: Option<String>,
    parser: RecordParser,
    sink: Arc<dyn EventSink>,
}

#[async_trait]
impl ConnectionHook for SubscribeHook {
    async fn on_connected(&self, session: Session) -> Result<Activity, WireError> {
        session.subscribe(&self.topics, self.qos).await?;
        info!("[{}] Subscribed to {:?}", self.id, self.topics);

        let id = self.id.clone();
        let sink = self.sink.clone();
        let separator = self.separator.clone();
        let parser = self.parser.clone();
        Ok(Activity::spawn(async move {
            session
                .receive(|message| {
                    dispatch(&id, sink.as_ref(), &parser, &message, separator.as_deref())
                })
                .await
        }))
    }
}

fn dispatch(
    id: &str,
    sink: &dyn EventSink,
    parser: &RecordParser,
    message: &InboundMessage,
    separator: Option<&str>,
) {
    for parsed in mapper::message_to_events(message, separator, parser, Utc::now()) {
        let event = match parsed {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    "[{id}] Failed to parse payload on topic '{}': {e}",
                    message.topic
                );
                continue;
            }
        };
        if let Err(e) = sink.emit(event) {
            error!(
                "[{id}] Failed to emit event from topic '{}': {e}",
                message.topic
            );
        }
    }
}
