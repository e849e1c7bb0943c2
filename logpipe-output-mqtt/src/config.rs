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

//! Configuration types for the MQTT output plugin.

use logpipe_mqtt_proxy::{parse_qos, ProxyConfig, ProxyError, QoS};
use serde::Deserialize;

use crate::publisher::{RecordFormat, TimeFormat, TopicRewrite};

/// Configuration for the MQTT output.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttOutputConfig {
    /// Unique output identifier.
    pub id: String,
    /// Broker connection and reconnect settings.
    #[serde(flatten)]
    pub proxy: ProxyConfig,
    /// Ask the broker to retain the last message per topic (default: false).
    #[serde(default)]
    pub retain: bool,
    /// Publish QoS level (default: 0).
    #[serde(default)]
    pub qos: u8,
    /// Separator between records of one batch (default: tab).
    #[serde(default = "default_separator")]
    pub bulk_trans_sep: String,
    /// Field that receives the event time; `null` leaves it out.
    #[serde(default = "default_time_key")]
    pub time_key: Option<String>,
    /// `None` for epoch seconds, `"iso8601"`, or a strftime pattern.
    #[serde(default)]
    pub time_format: Option<String>,
    /// Add the publish time in epoch milliseconds (default: false).
    #[serde(default)]
    pub send_time: bool,
    #[serde(default = "default_send_time_key")]
    pub send_time_key: String,
    #[serde(default)]
    pub topic_rewrite_pattern: Option<String>,
    #[serde(default)]
    pub topic_rewrite_replacement: Option<String>,
}

fn default_separator() -> String {
    "\t".to_string()
}

fn default_time_key() -> Option<String> {
    Some("time".to_string())
}

fn default_send_time_key() -> String {
    "send_time".to_string()
}

impl MqttOutputConfig {
    /// Start building a new config with the required fields.
    pub fn builder(id: impl Into<String>, host: impl Into<String>) -> MqttOutputConfigBuilder {
        MqttOutputConfigBuilder {
            config: MqttOutputConfig {
                id: id.into(),
                proxy: ProxyConfig::builder(host).build(),
                retain: false,
                qos: 0,
                bulk_trans_sep: default_separator(),
                time_key: default_time_key(),
                time_format: None,
                send_time: false,
                send_time_key: default_send_time_key(),
                topic_rewrite_pattern: None,
                topic_rewrite_replacement: None,
            },
        }
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        self.proxy.validate()?;
        self.publish_qos()?;
        self.record_format()?;
        self.topic_rewrite()?;
        Ok(())
    }

    pub fn publish_qos(&self) -> Result<QoS, ProxyError> {
        parse_qos(self.qos)
    }

    pub fn record_format(&self) -> Result<RecordFormat, ProxyError> {
        let time_format = TimeFormat::parse(self.time_format.as_deref())
            .map_err(|e| ProxyError::Config(format!("[{}] {e}", self.id)))?;
        Ok(RecordFormat {
            time_key: self.time_key.clone(),
            time_format,
            send_time_key: self.send_time.then(|| self.send_time_key.clone()),
        })
    }

    pub fn topic_rewrite(&self) -> Result<Option<TopicRewrite>, ProxyError> {
        match (&self.topic_rewrite_pattern, &self.topic_rewrite_replacement) {
            (None, None) => Ok(None),
            (Some(pattern), Some(replacement)) => TopicRewrite::new(pattern, replacement.as_str())
                .map(Some)
                .map_err(|e| {
                    ProxyError::Config(format!(
                        "[{}] invalid topic_rewrite_pattern '{pattern}': {e}",
                        self.id
                    ))
                }),
            _ => Err(ProxyError::Config(format!(
                "[{}] topic_rewrite_pattern and topic_rewrite_replacement must be set together",
                self.id
            ))),
        }
    }
}

/// Builder for [`MqttOutputConfig`].
pub struct MqttOutputConfigBuilder {
    config: MqttOutputConfig,
}

impl MqttOutputConfigBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.config.proxy.port = port;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.proxy.client_id = Some(client_id.into());
        self
    }

    /// Replaces all connection settings.
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxy = proxy;
        self
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.config.retain = retain;
        self
    }

    pub fn qos(mut self, qos: u8) -> Self {
        self.config.qos = qos;
        self
    }

    pub fn bulk_trans_sep(mut self, separator: impl Into<String>) -> Self {
        self.config.bulk_trans_sep = separator.into();
        self
    }

    pub fn time_key(mut self, key: Option<&str>) -> Self {
        self.config.time_key = key.map(str::to_string);
        self
    }

    pub fn time_format(mut self, format: impl Into<String>) -> Self {
        self.config.time_format = Some(format.into());
        self
    }

    pub fn send_time(mut self, key: impl Into<String>) -> Self {
        self.config.send_time = true;
        self.config.send_time_key = key.into();
        self
    }

    pub fn topic_rewrite(
        mut self,
        pattern: impl Into<String>,
        replacement: impl Into<String>,
    ) -> Self {
        self.config.topic_rewrite_pattern = Some(pattern.into());
        self.config.topic_rewrite_replacement = Some(replacement.into());
        self
    }

    /// Build the config.
    pub fn build(self) -> MqttOutputConfig {
        self.config
    }
}
