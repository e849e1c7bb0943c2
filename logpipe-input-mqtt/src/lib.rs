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

//! MQTT input plugin for logpipe.
//!
//! Subscribes to one or more topic filters and turns every message into
//! pipeline events. The topic becomes the event tag (`/` mapped to `.`).
//! Bulk payloads are split on a separator and each piece is parsed as a JSON
//! record.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use logpipe_input_mqtt::{ChannelSink, MqttInput, MqttInputConfig};
//!
//! let config = MqttInputConfig::builder("mqtt-in", "localhost", "sensors/#").build();
//! let (sink, mut events) = ChannelSink::new();
//! let input = MqttInput::new(config, Arc::new(sink))?;
//! input.start().await?;
//! while let Some(event) = events.recv().await {
//!     println!("{} {} {:?}", event.tag, event.time, event.record);
//! }
//! ```

pub mod config;
pub mod input;
pub mod mapper;
pub mod sink;

pub use config::{MqttInputConfig, MqttInputConfigBuilder, TopicFilter};
pub use input::MqttInput;
pub use mapper::{Event, PayloadFormat, RecordParser};
pub use sink::{ChannelSink, EventSink};
