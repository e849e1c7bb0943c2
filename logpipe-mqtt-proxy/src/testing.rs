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

//! In-memory [`Connector`] and [`Delay`] for exercising the proxy and the
//! plugins without a broker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::QoS;
use tokio::sync::{mpsc, watch};

use crate::client::{Connector, InboundMessage, WireClient};
use crate::config::ConnectionOptions;
use crate::delay::Delay;
use crate::error::WireError;

#[derive(Default)]
struct Script {
    connects: Mutex<VecDeque<Result<(), WireError>>>,
    publishes: Mutex<VecDeque<Result<(), WireError>>>,
    refuse_by_default: AtomicBool,
    attempts: Mutex<Vec<ConnectionOptions>>,
    clients: Mutex<Vec<Arc<MockClient>>>,
    published: Mutex<Vec<(String, Vec<u8>, bool, QoS)>>,
    subscriptions: Mutex<Vec<String>>,
}

/// Scripted connector. Unscripted connects succeed unless
/// [`MockConnector::refusing`] was used; unscripted publishes succeed.
#[derive(Clone, Default)]
pub struct MockConnector {
    script: Arc<Script>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector whose unscripted connects fail with a network error.
    pub fn refusing() -> Self {
        let connector = Self::default();
        connector.script.refuse_by_default.store(true, Ordering::SeqCst);
        connector
    }

    pub fn refuse_by_default(&self, refuse: bool) {
        self.script.refuse_by_default.store(refuse, Ordering::SeqCst);
    }

    /// Queues results for the next connect calls.
    pub fn script_connects(&self, results: impl IntoIterator<Item = Result<(), WireError>>) {
        self.script.connects.lock().unwrap().extend(results);
    }

    /// Queues results for the next publish calls.
    pub fn script_publishes(&self, results: impl IntoIterator<Item = Result<(), WireError>>) {
        self.script.publishes.lock().unwrap().extend(results);
    }

    /// Hosts of every opened client, in order.
    pub fn attempted_hosts(&self) -> Vec<String> {
        self.attempts().into_iter().map(|o| o.host).collect()
    }

    pub fn attempts(&self) -> Vec<ConnectionOptions> {
        self.script.attempts.lock().unwrap().clone()
    }

    pub fn clients(&self) -> Vec<Arc<MockClient>> {
        self.script.clients.lock().unwrap().clone()
    }

    pub fn latest(&self) -> Option<Arc<MockClient>> {
        self.script.clients.lock().unwrap().last().cloned()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>, bool, QoS)> {
        self.script.published.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.script.subscriptions.lock().unwrap().clone()
    }
}

impl Connector for MockConnector {
    fn open(&self, options: &ConnectionOptions) -> Arc<dyn WireClient> {
        self.script.attempts.lock().unwrap().push(options.clone());
        let client = Arc::new(MockClient::new(self.script.clone()));
        self.script.clients.lock().unwrap().push(client.clone());
        client
    }
}

/// A client handed out by [`MockConnector`].
pub struct MockClient {
    script: Arc<Script>,
    connected: AtomicBool,
    disconnects: AtomicUsize,
    link: watch::Sender<Option<WireError>>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
}

impl MockClient {
    fn new(script: Arc<Script>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            script,
            connected: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
            link: watch::channel(None).0,
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    /// Simulates the network link dropping underneath the client.
    pub fn break_link(&self, error: WireError) {
        self.connected.store(false, Ordering::SeqCst);
        self.link.send_replace(Some(error));
    }

    /// Delivers a message to the running receive loop.
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        let _ = self.inbound_tx.send(InboundMessage::new(topic, payload));
    }

    /// Number of disconnects that actually closed a live connection.
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WireClient for MockClient {
    async fn connect(&self) -> Result<(), WireError> {
        let scripted = self.script.connects.lock().unwrap().pop_front();
        let result = scripted.unwrap_or_else(|| {
            if self.script.refuse_by_default.load(Ordering::SeqCst) {
                Err(WireError::Network("connection refused".into()))
            } else {
                Ok(())
            }
        });
        if result.is_ok() {
            self.link.send_replace(None);
            self.connected.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn disconnect(&self) -> Result<(), WireError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            self.link
                .send_replace(Some(WireError::Network("closed by client".into())));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, topics: &[String], _qos: QoS) -> Result<(), WireError> {
        if !self.is_connected() {
            return Err(WireError::NotConnected);
        }
        self.script
            .subscriptions
            .lock()
            .unwrap()
            .extend(topics.iter().cloned());
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        qos: QoS,
    ) -> Result<(), WireError> {
        if !self.is_connected() {
            return Err(WireError::NotConnected);
        }
        let scripted = self.script.publishes.lock().unwrap().pop_front();
        let result = scripted.unwrap_or(Ok(()));
        if result.is_ok() {
            self.script
                .published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload, retain, qos));
        }
        result
    }

    async fn receive(
        &self,
        handler: &mut (dyn FnMut(InboundMessage) + Send),
    ) -> Result<(), WireError> {
        if !self.is_connected() {
            return Err(WireError::NotConnected);
        }
        let mut link = self.link.subscribe();
        let mut inbound = self.inbound_rx.lock().await;
        loop {
            let broken = link.borrow_and_update().clone();
            if let Some(e) = broken {
                return Err(e);
            }
            tokio::select! {
                changed = link.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                Some(message) = inbound.recv() => handler(message),
            }
        }
    }
}

/// Records requested delays and returns immediately.
#[derive(Clone, Default)]
pub struct RecordingDelay {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingDelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

#[async_trait]
impl Delay for RecordingDelay {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}

/// A delay that never elapses; only shutdown gets the proxy out of it.
#[derive(Clone, Copy, Default)]
pub struct NeverDelay;

#[async_trait]
impl Delay for NeverDelay {
    async fn sleep(&self, _duration: Duration) {
        std::future::pending::<()>().await;
    }
}
