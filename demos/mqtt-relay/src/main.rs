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

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};
use logpipe_input_mqtt::{ChannelSink, MqttInput, MqttInputConfig};
use logpipe_output_mqtt::{MqttOutput, MqttOutputConfig};
use serde::Deserialize;

#[derive(Deserialize)]
struct RelayConfig {
    input: MqttInputConfig,
    output: MqttOutputConfig,
}

fn load_config() -> Result<RelayConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {path}"))?;
            serde_json::from_str(&text).with_context(|| format!("invalid config file {path}"))
        }
        None => Ok(RelayConfig {
            input: MqttInputConfig::builder("mqtt-in", "localhost", "sensors/#").build(),
            output: MqttOutputConfig::builder("mqtt-out", "localhost")
                .port(1884)
                .build(),
        }),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting MQTT relay...");
    let config = load_config()?;

    // Records flow input -> channel -> output; tags and event times pass through.
    let (sink, mut events) = ChannelSink::new();
    let input = MqttInput::new(config.input, Arc::new(sink))?;
    let output = MqttOutput::new(config.output)?;

    output.start().await?;
    input.start().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            reason = input.closed() => {
                error!("Input stopped: {reason:?}");
                break;
            }
            reason = output.closed() => {
                error!("Output stopped: {reason:?}");
                break;
            }
            Some(event) = events.recv() => {
                match output.emit_record(&event.tag, event.time, &event.record).await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => {
                        error!("Giving up on output: {e}");
                        break;
                    }
                    Err(e) => warn!("Dropped event for '{}': {e}", event.tag),
                }
            }
        }
    }

    input.stop().await?;
    output.stop().await?;
    info!("MQTT relay stopped");
    Ok(())
}
