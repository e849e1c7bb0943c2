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

//! MQTT output plugin for logpipe.
//!
//! Publishes pipeline events to an MQTT broker. The event tag becomes the
//! topic (`.` mapped to `/`, optionally rewritten by a regex). Records can be
//! sent one per message or joined into bulk messages.
//!
//! # Example
//!
//! ```ignore
//! use logpipe_output_mqtt::{MqttOutput, MqttOutputConfig};
//!
//! let config = MqttOutputConfig::builder("mqtt-out", "localhost")
//!     .qos(1)
//!     .build();
//! let output = MqttOutput::new(config)?;
//! output.start().await?;
//! output.emit("app.access", br#"{"path":"/"}"#.to_vec()).await?;
//! ```

pub mod config;
pub mod output;
pub mod publisher;

pub use config::{MqttOutputConfig, MqttOutputConfigBuilder};
pub use output::MqttOutput;
pub use publisher::{RecordFormat, TimeFormat, TopicRewrite};
