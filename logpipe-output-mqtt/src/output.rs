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

//! MQTT output: publishes pipeline events through the connection proxy.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use logpipe_mqtt_proxy::{
    Activity, ConnectionHook, ConnectionProxy, Connector, Delay, ProxyError, ProxyResult,
    ProxyState, QoS, RumqttConnector, Session, TokioDelay, WireError,
};
use serde_json::{Map, Value};

use crate::config::MqttOutputConfig;
use crate::publisher::{self, RecordFormat, TopicRewrite};

/// MQTT output plugin.
///
/// While connected the output only watches the link; events are published
/// from the caller's task via [`MqttOutput::emit`] and friends. Publish
/// failures are returned so the pipeline can retry the chunk, and also feed
/// the proxy's reconnect logic.
pub struct MqttOutput {
    config: MqttOutputConfig,
    proxy: ConnectionProxy,
    qos: QoS,
    format: RecordFormat,
    rewrite: Option<TopicRewrite>,
}

impl MqttOutput {
    /// Create a new MQTT output backed by rumqttc.
    pub fn new(config: MqttOutputConfig) -> Result<Self> {
        Self::with_runtime(
            config,
            Arc::new(RumqttConnector::new()),
            Arc::new(TokioDelay),
        )
    }

    pub fn with_runtime(
        config: MqttOutputConfig,
        connector: Arc<dyn Connector>,
        delay: Arc<dyn Delay>,
    ) -> Result<Self> {
        config.validate()?;
        let qos = config.publish_qos()?;
        let format = config.record_format()?;
        let rewrite = config.topic_rewrite()?;
        let proxy = ConnectionProxy::builder(&config.id, config.proxy.clone(), connector)
            .delay(delay)
            .build()?;
        Ok(Self {
            config,
            proxy,
            qos,
            format,
            rewrite,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &MqttOutputConfig {
        &self.config
    }

    pub async fn start(&self) -> Result<()> {
        info!(
            "[{}] Starting MQTT output (broker={}:{}, retain={}, qos={})",
            self.config.id,
            self.config.proxy.host,
            self.config.proxy.port,
            self.config.retain,
            self.config.qos
        );
        self.proxy.start(LinkWatch).await?;
        info!("[{}] MQTT output started", self.config.id);
        Ok(())
    }

    /// Stops the output. A fatal connection error that already ended the
    /// output is logged, not returned.
    pub async fn stop(&self) -> Result<()> {
        match self.proxy.shutdown().await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                warn!("[{}] MQTT output had stopped on error: {e}", self.config.id);
            }
            Err(e) => return Err(e.into()),
        }
        info!("[{}] MQTT output stopped", self.config.id);
        Ok(())
    }

    pub fn state(&self) -> ProxyState {
        self.proxy.state()
    }

    /// Resolves once the output has stopped, with the error that stopped it.
    pub async fn closed(&self) -> Option<ProxyError> {
        self.proxy.closed().await
    }

    /// Topic an event with `tag` is published to.
    pub fn topic_for(&self, tag: &str) -> String {
        publisher::tag_to_topic(tag, self.rewrite.as_ref())
    }

    /// Publishes a raw payload for `tag`.
    pub async fn emit(&self, tag: &str, payload: Vec<u8>) -> ProxyResult<()> {
        let topic = self.topic_for(tag);
        debug!(
            "[{}] Publishing {} bytes to '{topic}'",
            self.config.id,
            payload.len()
        );
        self.proxy
            .publish_through(&topic, payload, self.config.retain, self.qos)
            .await
    }

    /// Publishes `payloads` as one message, joined by `bulk_trans_sep`.
    pub async fn emit_batch(&self, tag: &str, payloads: &[Vec<u8>]) -> ProxyResult<()> {
        if payloads.is_empty() {
            return Ok(());
        }
        self.emit(tag, publisher::join_batch(payloads, &self.config.bulk_trans_sep))
            .await
    }

    /// Publishes one record as JSON with the configured time fields.
    pub async fn emit_record(
        &self,
        tag: &str,
        time: DateTime<Utc>,
        record: &Map<String, Value>,
    ) -> ProxyResult<()> {
        let payload = self.encode(time, record, Utc::now())?;
        self.emit(tag, payload).await
    }

    /// Publishes several records as one bulk message.
    pub async fn emit_records(
        &self,
        tag: &str,
        records: &[(DateTime<Utc>, Map<String, Value>)],
    ) -> ProxyResult<()> {
        let now = Utc::now();
        let payloads = records
            .iter()
            .map(|(time, record)| self.encode(*time, record, now))
            .collect::<ProxyResult<Vec<_>>>()?;
        self.emit_batch(tag, &payloads).await
    }

    fn encode(
        &self,
        time: DateTime<Utc>,
        record: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> ProxyResult<Vec<u8>> {
        self.format
            .to_payload(record, time, now)
            .map_err(encode_error)
    }
}

fn encode_error(error: serde_json::Error) -> ProxyError {
    ProxyError::Encode(error.to_string())
}

/// Keeps a receive loop running so a dropped link is noticed between publishes.
struct LinkWatch;

#[async_trait]
impl ConnectionHook for LinkWatch {
    async fn on_connected(&self, session: Session) -> Result<Activity, WireError> {
        Ok(Activity::spawn(async move { session.receive(|_| {}).await }))
    }
}
