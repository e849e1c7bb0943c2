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

//! Maps inbound MQTT messages to pipeline events.

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use logpipe_mqtt_proxy::InboundMessage;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Field that holds the payload text when records are not parsed.
pub const RAW_MESSAGE_KEY: &str = "message";

/// A record handed to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub tag: String,
    pub time: DateTime<Utc>,
    pub record: Map<String, Value>,
}

/// How each payload (or bulk piece) is turned into a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// A JSON object per piece.
    #[default]
    Json,
    /// The text as is, under [`RAW_MESSAGE_KEY`].
    #[serde(rename = "none")]
    Raw,
}

#[derive(Debug, Clone)]
pub struct RecordParser {
    pub format: PayloadFormat,
    /// Field carrying the event time in JSON records. It is removed from the
    /// record when it holds a usable time.
    pub time_key: Option<String>,
}

impl RecordParser {
    /// Parses one piece into `(time, record)`, using `now` when the record
    /// carries no time.
    pub fn parse(
        &self,
        piece: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(DateTime<Utc>, Map<String, Value>)> {
        match self.format {
            PayloadFormat::Raw => {
                let mut record = Map::new();
                record.insert(
                    RAW_MESSAGE_KEY.to_string(),
                    Value::String(String::from_utf8_lossy(piece).into_owned()),
                );
                Ok((now, record))
            }
            PayloadFormat::Json => {
                let Value::Object(mut record) = serde_json::from_slice::<Value>(piece)? else {
                    return Err(anyhow!("payload is not a JSON object"));
                };
                let time = self
                    .time_key
                    .as_ref()
                    .and_then(|key| record.get(key).and_then(parse_time).map(|time| (key, time)));
                match time {
                    Some((key, time)) => {
                        record.remove(key);
                        Ok((time, record))
                    }
                    None => Ok((now, record)),
                }
            }
        }
    }
}

/// Epoch seconds (integer, fractional, or as a string) or RFC 3339.
fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(secs) => Utc.timestamp_opt(secs, 0).single(),
            None => {
                let secs = n.as_f64()?;
                let whole = secs.floor();
                let nanos = ((secs - whole) * 1e9) as u32;
                Utc.timestamp_opt(whole as i64, nanos).single()
            }
        },
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|time| time.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                text.parse::<i64>()
                    .ok()
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            }),
        _ => None,
    }
}

/// `sensors/room1/temp` becomes `sensors.room1.temp`.
pub fn topic_to_tag(topic: &str) -> String {
    topic.replace('/', ".")
}

/// Splits `payload` on every occurrence of `separator`, skipping empty pieces.
pub fn split_bulk<'a>(payload: &'a [u8], separator: &'a [u8]) -> Vec<&'a [u8]> {
    if separator.is_empty() {
        return if payload.is_empty() { Vec::new() } else { vec![payload] };
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + separator.len() <= payload.len() {
        if &payload[i..i + separator.len()] == separator {
            pieces.push(&payload[start..i]);
            i += separator.len();
            start = i;
        } else {
            i += 1;
        }
    }
    pieces.push(&payload[start..]);
    pieces.retain(|piece| !piece.is_empty());
    pieces
}

/// Converts one inbound message into events, one result per piece.
///
/// With a separator the payload is split first and every piece is parsed on
/// its own, so one bad piece does not cost the rest of the batch. All events
/// share the tag derived from the topic.
pub fn message_to_events(
    message: &InboundMessage,
    separator: Option<&str>,
    parser: &RecordParser,
    now: DateTime<Utc>,
) -> Vec<Result<Event>> {
    let tag = topic_to_tag(&message.topic);
    let pieces = match separator {
        Some(separator) => split_bulk(&message.payload, separator.as_bytes()),
        None => vec![message.payload.as_slice()],
    };
    pieces
        .into_iter()
        .map(|piece| {
            let (time, record) = parser.parse(piece, now)?;
            Ok(Event {
                tag: tag.clone(),
                time,
                record,
            })
        })
        .collect()
}
