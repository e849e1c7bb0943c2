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

//! Configuration types for the MQTT input plugin.

use logpipe_mqtt_proxy::{parse_qos, ProxyConfig, ProxyError, QoS};
use serde::Deserialize;

use crate::mapper::{PayloadFormat, RecordParser};

/// One topic filter or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TopicFilter {
    One(String),
    Many(Vec<String>),
}

impl Default for TopicFilter {
    fn default() -> Self {
        TopicFilter::One("#".to_string())
    }
}

impl TopicFilter {
    pub fn filters(&self) -> Vec<String> {
        match self {
            TopicFilter::One(topic) => vec![topic.clone()],
            TopicFilter::Many(topics) => topics.clone(),
        }
    }
}

/// Configuration for the MQTT input.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttInputConfig {
    /// Unique input identifier, used in logs and generated client IDs.
    pub id: String,
    /// Broker connection and reconnect settings.
    #[serde(flatten)]
    pub proxy: ProxyConfig,
    /// Topic filter(s) to subscribe to (supports wildcards like `sensors/#`).
    #[serde(default)]
    pub topic: TopicFilter,
    /// Subscription QoS level (default: 1).
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Split each payload into several events on `bulk_trans_sep` (default: true).
    #[serde(default = "default_bulk_trans")]
    pub bulk_trans: bool,
    #[serde(default = "default_separator")]
    pub bulk_trans_sep: String,
    /// `json` (default) or `none` to keep each piece as text.
    #[serde(default)]
    pub format: PayloadFormat,
    /// Field holding the event time in JSON records; `null` always uses
    /// the receive time.
    #[serde(default = "default_time_key")]
    pub time_key: Option<String>,
}

fn default_qos() -> u8 {
    1
}

fn default_bulk_trans() -> bool {
    true
}

fn default_separator() -> String {
    "\t".to_string()
}

fn default_time_key() -> Option<String> {
    Some("time".to_string())
}

impl MqttInputConfig {
    /// Start building a new config with the required fields.
    pub fn builder(
        id: impl Into<String>,
        host: impl Into<String>,
        topic: impl Into<String>,
    ) -> MqttInputConfigBuilder {
        MqttInputConfigBuilder {
            id: id.into(),
            proxy: ProxyConfig::builder(host).build(),
            topic: TopicFilter::One(topic.into()),
            qos: default_qos(),
            bulk_trans: default_bulk_trans(),
            bulk_trans_sep: default_separator(),
            format: PayloadFormat::default(),
            time_key: default_time_key(),
        }
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        self.proxy.validate()?;
        self.subscription_qos()?;

        let topics = self.topic.filters();
        if topics.is_empty() || topics.iter().any(|t| t.is_empty()) {
            return Err(ProxyError::Config(format!(
                "[{}] topic filters must not be empty",
                self.id
            )));
        }
        if self.bulk_trans && self.bulk_trans_sep.is_empty() {
            return Err(ProxyError::Config(format!(
                "[{}] bulk_trans_sep must not be empty",
                self.id
            )));
        }
        Ok(())
    }

    pub fn subscription_qos(&self) -> Result<QoS, ProxyError> {
        parse_qos(self.qos)
    }

    pub fn record_parser(&self) -> RecordParser {
        RecordParser {
            format: self.format,
            time_key: self.time_key.clone(),
        }
    }

    /// Separator to split payloads on, if bulk transfer is enabled.
    pub fn bulk_separator(&self) -> Option<&str> {
        self.bulk_trans.then_some(self.bulk_trans_sep.as_str())
    }
}

/// Builder for [`MqttInputConfig`].
pub struct MqttInputConfigBuilder {
    id: String,
    proxy: ProxyConfig,
    topic: TopicFilter,
    qos: u8,
    bulk_trans: bool,
    bulk_trans_sep: String,
    format: PayloadFormat,
    time_key: Option<String>,
}

impl MqttInputConfigBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.proxy.port = port;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.proxy.client_id = Some(client_id.into());
        self
    }

    /// Replaces all connection settings, including the host.
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topic = TopicFilter::Many(topics.into_iter().map(Into::into).collect());
        self
    }

    pub fn qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }

    /// Split payloads on `separator`, or pass them through whole with `None`.
    pub fn bulk_trans(mut self, separator: Option<&str>) -> Self {
        self.bulk_trans = separator.is_some();
        if let Some(separator) = separator {
            self.bulk_trans_sep = separator.to_string();
        }
        self
    }

    pub fn format(mut self, format: PayloadFormat) -> Self {
        self.format = format;
        self
    }

    pub fn time_key(mut self, key: Option<&str>) -> Self {
        self.time_key = key.map(str::to_string);
        self
    }

    /// Build the config.
    pub fn build(self) -> MqttInputConfig {
        MqttInputConfig {
            id: self.id,
            proxy: self.proxy,
            topic: self.topic,
            qos: self.qos,
            bulk_trans: self.bulk_trans,
            bulk_trans_sep: self.bulk_trans_sep,
            format: self.format,
            time_key: self.time_key,
        }
    }
}
