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

//! [`WireClient`] implementation on top of `rumqttc`.
//!
//! rumqttc reconnects on its own whenever its event loop is polled after an
//! error. Here the event loop is driven only until the first error, so that
//! reconnecting stays with the proxy.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use rumqttc::{
    AsyncClient, ClientError, ConnectionError, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS,
    StateError, SubscribeFilter, Transport,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::client::{valid_publish_topic, Connector, InboundMessage, WireClient};
use crate::config::{ConnectionOptions, TlsOptions};
use crate::error::WireError;

const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Opens [`RumqttClient`]s.
#[derive(Debug, Clone)]
pub struct RumqttConnector {
    capacity: usize,
    connect_timeout: Duration,
}

impl Default for RumqttConnector {
    fn default() -> Self {
        Self {
            capacity: 100,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl RumqttConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request and inbound channel capacity.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Time allowed between opening the socket and receiving CONNACK.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Connector for RumqttConnector {
    fn open(&self, options: &ConnectionOptions) -> Arc<dyn WireClient> {
        Arc::new(RumqttClient::new(
            options.clone(),
            self.capacity,
            self.connect_timeout,
        ))
    }
}

/// A single rumqttc connection.
pub struct RumqttClient {
    options: ConnectionOptions,
    capacity: usize,
    connect_timeout: Duration,
    connected: Arc<AtomicBool>,
    link: Mutex<Option<Link>>,
}

struct Link {
    client: AsyncClient,
    driver: JoinHandle<()>,
    inbound: Option<mpsc::Receiver<InboundMessage>>,
    broken: watch::Receiver<Option<WireError>>,
}

impl RumqttClient {
    pub fn new(options: ConnectionOptions, capacity: usize, connect_timeout: Duration) -> Self {
        Self {
            options,
            capacity,
            connect_timeout,
            connected: Arc::new(AtomicBool::new(false)),
            link: Mutex::new(None),
        }
    }

    async fn request_client(&self) -> Result<AsyncClient, WireError> {
        if !self.is_connected() {
            return Err(WireError::NotConnected);
        }
        self.link
            .lock()
            .await
            .as_ref()
            .map(|link| link.client.clone())
            .ok_or(WireError::NotConnected)
    }
}

#[async_trait]
impl WireClient for RumqttClient {
    async fn connect(&self) -> Result<(), WireError> {
        let mut link = self.link.lock().await;
        if link.is_some() && self.is_connected() {
            return Ok(());
        }

        let mqtt_options = mqtt_options(&self.options)?;
        let (client, mut eventloop) = AsyncClient::new(mqtt_options, self.capacity);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(classify(e)),
                }
            }
        };
        match tokio::time::timeout(self.connect_timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(WireError::Timeout(format!(
                    "no CONNACK from {}:{} within {:?}",
                    self.options.host, self.options.port, self.connect_timeout
                )))
            }
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(self.capacity);
        let (broken_tx, broken_rx) = watch::channel(None);
        self.connected.store(true, Ordering::SeqCst);
        let driver = tokio::spawn(drive(
            eventloop,
            inbound_tx,
            broken_tx,
            self.connected.clone(),
        ));

        *link = Some(Link {
            client,
            driver,
            inbound: Some(inbound_rx),
            broken: broken_rx,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), WireError> {
        let Some(mut link) = self.link.lock().await.take() else {
            return Ok(());
        };
        if self.connected.swap(false, Ordering::SeqCst) {
            // The event loop may already be gone; nothing to report then.
            if let Err(e) = link.client.disconnect().await {
                debug!("disconnect request not delivered: {e}");
            }
            let _ = tokio::time::timeout(DISCONNECT_GRACE, &mut link.driver).await;
        }
        link.driver.abort();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, topics: &[String], qos: QoS) -> Result<(), WireError> {
        let client = self.request_client().await?;
        let filters = topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), qos));
        client
            .subscribe_many(filters)
            .await
            .map_err(|e| WireError::Network(format!("subscribe request not delivered: {e}")))
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        qos: QoS,
    ) -> Result<(), WireError> {
        if !valid_publish_topic(topic) {
            return Err(WireError::Protocol(format!("invalid publish topic '{topic}'")));
        }
        let client = self.request_client().await?;
        client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| publish_error(topic, self.is_connected(), e))
    }

    async fn receive(
        &self,
        handler: &mut (dyn FnMut(InboundMessage) + Send),
    ) -> Result<(), WireError> {
        let (mut inbound, broken) = {
            let mut guard = self.link.lock().await;
            let link = guard.as_mut().ok_or(WireError::NotConnected)?;
            let inbound = link
                .inbound
                .take()
                .ok_or_else(|| WireError::Other("receive loop already running".into()))?;
            (inbound, link.broken.clone())
        };

        while let Some(message) = inbound.recv().await {
            handler(message);
        }

        let cause = broken.borrow().clone();
        match cause {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn drive(
    mut eventloop: EventLoop,
    inbound: mpsc::Sender<InboundMessage>,
    broken: watch::Sender<Option<WireError>>,
    connected: Arc<AtomicBool>,
) {
    let cause = loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let message = InboundMessage::new(publish.topic, publish.payload.to_vec());
                // No receiver just means nobody is interested.
                let _ = inbound.send(message).await;
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                break Some(WireError::Network("broker closed the connection".into()));
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break None,
            Ok(_) => {}
            Err(e) => break Some(classify(e)),
        }
    };

    if let Some(e) = &cause {
        warn!("mqtt event loop stopped: {e}");
    }
    connected.store(false, Ordering::SeqCst);
    broken.send_replace(cause);
}

/// Maps a rumqttc connection error onto the proxy's fault classes.
pub fn classify(error: ConnectionError) -> WireError {
    let message = error.to_string();
    match error {
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
            WireError::Timeout(message)
        }
        ConnectionError::Io(e) => WireError::from(e),
        ConnectionError::MqttState(StateError::Io(e)) => WireError::from(e),
        ConnectionError::MqttState(_)
        | ConnectionError::ConnectionRefused(_)
        | ConnectionError::NotConnAck(_) => WireError::Protocol(message),
        _ => WireError::Other(message),
    }
}

/// Translates connection options into rumqttc's.
pub fn mqtt_options(options: &ConnectionOptions) -> Result<MqttOptions, WireError> {
    let mut mqtt = MqttOptions::new(&options.client_id, &options.host, options.port);
    mqtt.set_keep_alive(options.keep_alive);
    mqtt.set_clean_session(options.clean_session);

    if let Some(credentials) = &options.credentials {
        mqtt.set_credentials(&credentials.username, &credentials.password);
    }
    if let Some(tls) = &options.tls {
        mqtt.set_transport(tls_transport(tls)?);
    }
    Ok(mqtt)
}

/// Only a request channel closed by a dropped link means "not connected".
/// A request refused on a live link is reported with its topic.
fn publish_error(topic: &str, connected: bool, error: ClientError) -> WireError {
    if connected {
        WireError::Protocol(format!("publish to '{topic}' rejected: {error}"))
    } else {
        WireError::NotConnected
    }
}

fn tls_transport(tls: &TlsOptions) -> Result<Transport, WireError> {
    let Some(ca_file) = &tls.ca_file else {
        return Ok(Transport::tls_with_default_config());
    };
    let ca = read_pem(ca_file)?;
    let client_auth = match (&tls.cert_file, &tls.key_file) {
        (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
        _ => None,
    };
    Ok(Transport::tls(ca, client_auth, None))
}

fn read_pem(path: &Path) -> Result<Vec<u8>, WireError> {
    std::fs::read(path)
        .map_err(|e| WireError::Other(format!("cannot read {}: {e}", path.display())))
}
