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

//! What plugins see of a live connection.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use rumqttc::QoS;
use tokio::task::JoinHandle;

use crate::client::{InboundMessage, WireClient};
use crate::error::WireError;

/// Invoked by the proxy after every successful connect.
///
/// The returned [`Activity`] is awaited by the proxy: its completion with an
/// error is how a broken link underneath a long-running receive loop is
/// discovered.
#[async_trait]
pub trait ConnectionHook: Send + Sync + 'static {
    async fn on_connected(&self, session: Session) -> Result<Activity, WireError>;
}

/// Subscribe/receive access to the current connection.
///
/// Connecting and disconnecting stay with the proxy.
#[derive(Clone)]
pub struct Session {
    client: Arc<dyn WireClient>,
    epoch: u64,
}

impl Session {
    pub(crate) fn new(client: Arc<dyn WireClient>, epoch: u64) -> Self {
        Self { client, epoch }
    }

    /// Sequence number of the connection this session belongs to.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub async fn subscribe(&self, topics: &[String], qos: QoS) -> Result<(), WireError> {
        self.client.subscribe(topics, qos).await
    }

    /// Runs `handler` for each inbound message until the link goes away.
    pub async fn receive<F>(&self, mut handler: F) -> Result<(), WireError>
    where
        F: FnMut(InboundMessage) + Send,
    {
        self.client.receive(&mut handler).await
    }

    pub(crate) fn client(&self) -> &Arc<dyn WireClient> {
        &self.client
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("epoch", &self.epoch)
            .field("connected", &self.client.is_connected())
            .finish()
    }
}

/// Background work started by a [`ConnectionHook`]. Aborted when dropped.
#[derive(Debug)]
pub struct Activity {
    handle: JoinHandle<Result<(), WireError>>,
}

impl Activity {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<(), WireError>> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Aborts the task and waits until it is gone.
    /// Must not be called once the activity has been polled to completion.
    pub(crate) async fn cancel(&mut self) {
        self.handle.abort();
        let _ = (&mut self.handle).await;
    }
}

impl Future for Activity {
    type Output = Result<(), WireError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(WireError::Other("background activity cancelled".into())),
            Err(e) => Err(WireError::Other(format!("background activity failed: {e}"))),
        })
    }
}

impl Drop for Activity {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
