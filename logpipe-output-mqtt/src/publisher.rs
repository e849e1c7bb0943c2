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

//! Turns pipeline records into MQTT topics and payloads.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Map, Value};

/// How the event time is written into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeFormat {
    /// Integer seconds since the Unix epoch.
    Epoch,
    Iso8601,
    Strftime(String),
}

impl TimeFormat {
    /// `None` selects [`TimeFormat::Epoch`]. Unknown strftime specifiers are rejected.
    pub fn parse(format: Option<&str>) -> Result<Self, String> {
        match format {
            None => Ok(TimeFormat::Epoch),
            Some("iso8601") => Ok(TimeFormat::Iso8601),
            Some(pattern) => {
                if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
                    return Err(format!("invalid time_format '{pattern}'"));
                }
                Ok(TimeFormat::Strftime(pattern.to_string()))
            }
        }
    }

    pub fn format(&self, time: DateTime<Utc>) -> Value {
        match self {
            TimeFormat::Epoch => Value::from(time.timestamp()),
            TimeFormat::Iso8601 => Value::String(time.to_rfc3339_opts(SecondsFormat::Secs, false)),
            TimeFormat::Strftime(pattern) => Value::String(time.format(pattern).to_string()),
        }
    }
}

/// Regex replacement applied to topics after the tag mapping.
#[derive(Debug, Clone)]
pub struct TopicRewrite {
    pattern: Regex,
    replacement: String,
}

impl TopicRewrite {
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replacement: replacement.into(),
        })
    }

    pub fn apply(&self, topic: &str) -> String {
        self.pattern
            .replace_all(topic, self.replacement.as_str())
            .into_owned()
    }
}

/// `app.web.access` becomes `app/web/access`, then `rewrite` is applied.
pub fn tag_to_topic(tag: &str, rewrite: Option<&TopicRewrite>) -> String {
    let topic = tag.replace('.', "/");
    match rewrite {
        Some(rewrite) => rewrite.apply(&topic),
        None => topic,
    }
}

/// Which metadata fields are merged into each record.
#[derive(Debug, Clone)]
pub struct RecordFormat {
    pub time_key: Option<String>,
    pub time_format: TimeFormat,
    pub send_time_key: Option<String>,
}

impl RecordFormat {
    /// Serialize `record` to JSON with send time and event time merged in.
    ///
    /// The event time is written last, so it wins over a record field or
    /// send time of the same name.
    pub fn to_payload(
        &self,
        record: &Map<String, Value>,
        time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> serde_json::Result<Vec<u8>> {
        let mut record = record.clone();
        if let Some(key) = &self.send_time_key {
            record.insert(key.clone(), Value::from(now.timestamp_millis()));
        }
        if let Some(key) = &self.time_key {
            record.insert(key.clone(), self.time_format.format(time));
        }
        serde_json::to_vec(&record)
    }
}

/// Join payloads into one message, separated by `separator`.
pub fn join_batch(payloads: &[Vec<u8>], separator: &str) -> Vec<u8> {
    payloads.join(separator.as_bytes())
}
