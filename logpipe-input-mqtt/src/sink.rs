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

//! Destinations for events produced by the input.

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;

use crate::mapper::Event;

/// Receives events from the input's receive loop.
///
/// `emit` runs on the receive task, so implementations should not block.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: Event) -> Result<()>;
}

/// Forwards events into an unbounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| anyhow!("event channel closed"))
    }
}
