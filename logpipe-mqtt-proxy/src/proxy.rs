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

//! The connection proxy: connect, run, fault, back off, reconnect.
//!
//! One owner task per proxy performs every state transition, so only one
//! reconnect sequence is ever in flight. Plugins interact with it through a
//! [`ConnectionHook`] (called after each successful connect) and through
//! [`ConnectionProxy::publish_through`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::QoS;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::backoff::Backoff;
use crate::client::{valid_publish_topic, Connector, WireClient};
use crate::config::ProxyConfig;
use crate::delay::{Delay, TokioDelay};
use crate::error::{ProxyError, ProxyResult, WireError};
use crate::frequency::{FailureRecord, RetryFrequencyGuard};
use crate::hook::{Activity, ConnectionHook, Session};
use crate::hosts::HostSelector;

/// Lifecycle of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Idle,
    Connecting,
    Connected,
    Faulted,
    ShuttingDown,
    Closed,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A publish failure handed to the owner task. Already recorded in the
/// frequency guard by the publisher.
#[derive(Debug)]
struct PublishFault {
    epoch: u64,
    error: WireError,
}

/// Why a connection ended.
enum Outcome {
    Shutdown,
    Fault { error: WireError, recorded: bool },
}

struct Inner {
    name: String,
    config: ProxyConfig,
    client_id: String,
    connector: Arc<dyn Connector>,
    delay: Arc<dyn Delay>,
    guard: Mutex<RetryFrequencyGuard>,
    session: RwLock<Option<Session>>,
    epoch: AtomicU64,
    faults: mpsc::UnboundedSender<PublishFault>,
    state: watch::Sender<ProxyState>,
    shutdown: watch::Sender<bool>,
    terminal: RwLock<Option<ProxyError>>,
}

/// Owns the broker connection and all retry state for one plugin.
pub struct ConnectionProxy {
    inner: Arc<Inner>,
    fault_rx: Mutex<Option<mpsc::UnboundedReceiver<PublishFault>>>,
    task: Mutex<Option<JoinHandle<ProxyResult<()>>>>,
}

/// Builder for [`ConnectionProxy`].
pub struct ConnectionProxyBuilder {
    name: String,
    config: ProxyConfig,
    connector: Arc<dyn Connector>,
    delay: Arc<dyn Delay>,
}

impl ConnectionProxyBuilder {
    /// Replaces the delay used between reconnect attempts.
    pub fn delay(mut self, delay: Arc<dyn Delay>) -> Self {
        self.delay = delay;
        self
    }

    /// Validates the configuration and builds an idle proxy.
    pub fn build(self) -> ProxyResult<ConnectionProxy> {
        self.config.validate()?;

        let (faults, fault_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ProxyState::Idle);
        let (shutdown, _) = watch::channel(false);
        let client_id = self.config.resolve_client_id(&self.name);
        let guard = RetryFrequencyGuard::new(self.config.max_retry_frequency);

        let inner = Inner {
            name: self.name,
            config: self.config,
            client_id,
            connector: self.connector,
            delay: self.delay,
            guard: Mutex::new(guard),
            session: RwLock::new(None),
            epoch: AtomicU64::new(0),
            faults,
            state,
            shutdown,
            terminal: RwLock::new(None),
        };
        Ok(ConnectionProxy {
            inner: Arc::new(inner),
            fault_rx: Mutex::new(Some(fault_rx)),
            task: Mutex::new(None),
        })
    }
}

impl ConnectionProxy {
    pub fn builder(
        name: impl Into<String>,
        config: ProxyConfig,
        connector: Arc<dyn Connector>,
    ) -> ConnectionProxyBuilder {
        ConnectionProxyBuilder {
            name: name.into(),
            config,
            connector,
            delay: Arc::new(TokioDelay),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Spawns the owner task. `hook` runs after every successful connect.
    pub async fn start<H: ConnectionHook>(&self, hook: H) -> ProxyResult<()> {
        let mut task = self.task.lock().await;
        let fault_rx = self.fault_rx.lock().await.take();
        let (Some(fault_rx), None) = (fault_rx, task.as_ref()) else {
            return Err(ProxyError::AlreadyStarted);
        };

        debug!("[{}] Starting mqtt proxy", self.inner.name);
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(run(inner, Arc::new(hook), fault_rx)));
        Ok(())
    }

    /// Publishes on the current connection.
    ///
    /// Protocol, timeout, network and other faults are recorded and hand the
    /// connection to the reconnect path before being returned as
    /// [`ProxyError::Publish`]. A publish on a link that already dropped
    /// returns [`ProxyError::NotConnected`] without touching retry state: the
    /// receive side has seen the same disconnection already. A topic that
    /// cannot be published to is rejected with [`ProxyError::InvalidTopic`]
    /// before anything is sent.
    pub async fn publish_through(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        qos: QoS,
    ) -> ProxyResult<()> {
        if let Some(fatal) = self.inner.terminal.read().await.clone() {
            return Err(fatal);
        }
        if !valid_publish_topic(topic) {
            return Err(ProxyError::InvalidTopic(topic.to_string()));
        }
        let session = self.inner.session.read().await.clone();
        let Some(session) = session else {
            return Err(ProxyError::NotConnected);
        };

        let error = match session.client().publish(topic, payload, retain, qos).await {
            Ok(()) => return Ok(()),
            Err(WireError::NotConnected) => {
                debug!(
                    "[{}] Publish to '{topic}' while not connected",
                    self.inner.name
                );
                return Err(ProxyError::NotConnected);
            }
            Err(e) => e,
        };

        let kind = error.kind();
        let verdict = {
            let mut guard = self.inner.guard.lock().await;
            guard.record(kind, error.to_string());
            guard.check()
        };
        warn!(
            "[{}] {kind} error while publishing to '{topic}': {error}",
            self.inner.name
        );
        let _ = self.inner.faults.send(PublishFault {
            epoch: session.epoch(),
            error: error.clone(),
        });

        match verdict {
            Err(fatal) => Err(fatal),
            Ok(()) => Err(ProxyError::Publish {
                kind,
                message: error.to_string(),
            }),
        }
    }

    /// Stops reconnecting, tears down the background activity and
    /// disconnects. Returns the fatal error if the proxy had already given up.
    pub async fn shutdown(&self) -> ProxyResult<()> {
        let task = self.task.lock().await.take();
        info!("[{}] Shutting down mqtt proxy", self.inner.name);
        self.inner.shutdown.send_replace(true);

        let Some(task) = task else {
            self.inner.close_session().await;
            self.inner.set_state(ProxyState::Closed);
            return Ok(());
        };
        self.inner.state.send_if_modified(|state| {
            let running = *state != ProxyState::Closed;
            if running {
                *state = ProxyState::ShuttingDown;
            }
            running
        });
        match task.await {
            Ok(result) => result,
            Err(e) => {
                self.inner.close_session().await;
                self.inner.set_state(ProxyState::Closed);
                Err(ProxyError::Internal(e.to_string()))
            }
        }
    }

    pub fn state(&self) -> ProxyState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ProxyState> {
        self.inner.state.subscribe()
    }

    /// Waits until the proxy is closed and returns the fatal error, if any.
    pub async fn closed(&self) -> Option<ProxyError> {
        let mut state = self.inner.state.subscribe();
        while *state.borrow_and_update() != ProxyState::Closed {
            if state.changed().await.is_err() {
                break;
            }
        }
        self.inner.terminal.read().await.clone()
    }

    /// Failures currently inside the frequency window, oldest first.
    pub async fn failure_history(&self) -> Vec<FailureRecord> {
        self.inner.guard.lock().await.history()
    }
}

impl Drop for ConnectionProxy {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
    }
}

async fn run(
    inner: Arc<Inner>,
    hook: Arc<dyn ConnectionHook>,
    mut faults: mpsc::UnboundedReceiver<PublishFault>,
) -> ProxyResult<()> {
    let mut stop = inner.shutdown.subscribe();
    let config = &inner.config;
    let mut backoff = Backoff::new(
        config.initial_interval(),
        config.max_retry_interval(),
        config.retry_growth_ratio,
    );
    let mut hosts = config
        .failover_hosts()
        .and_then(|hosts| HostSelector::new(hosts.to_vec(), config.max_host_rotation_retries));

    let result = loop {
        let host = hosts
            .as_ref()
            .map_or(config.host.as_str(), |h| h.current())
            .to_string();

        let outcome = inner
            .attempt(
                &host,
                hook.as_ref(),
                &mut backoff,
                hosts.as_mut(),
                &mut faults,
                &mut stop,
            )
            .await;
        let (error, recorded) = match outcome {
            Outcome::Shutdown => break Ok(()),
            Outcome::Fault { error, recorded } => (error, recorded),
        };

        inner.close_session().await;
        let interval = match inner
            .handle_fault(&host, error, recorded, hosts.as_mut(), &mut backoff)
            .await
        {
            Ok(interval) => interval,
            Err(fatal) => break Err(fatal),
        };

        tokio::select! {
            biased;
            _ = stopped(&mut stop) => break Ok(()),
            _ = inner.delay.sleep(interval) => {}
        }
    };

    inner.close_session().await;
    if let Err(fatal) = &result {
        *inner.terminal.write().await = Some(fatal.clone());
    }
    inner.set_state(ProxyState::Closed);
    debug!("[{}] mqtt proxy closed", inner.name);
    result
}

impl Inner {
    fn set_state(&self, state: ProxyState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("[{}] {previous} -> {state}", self.name);
        }
    }

    /// Takes the current session out of circulation and closes its handle.
    async fn close_session(&self) {
        let session = self.session.write().await.take();
        if let Some(session) = session {
            disconnect(&self.name, session.client().as_ref()).await;
        }
    }

    /// One connection: open, connect, hand over to the hook and wait for
    /// the link to fail.
    async fn attempt(
        &self,
        host: &str,
        hook: &dyn ConnectionHook,
        backoff: &mut Backoff,
        hosts: Option<&mut HostSelector>,
        faults: &mut mpsc::UnboundedReceiver<PublishFault>,
        stop: &mut watch::Receiver<bool>,
    ) -> Outcome {
        self.set_state(ProxyState::Connecting);
        self.close_session().await;

        let options = self.config.connection_options(host, &self.client_id);
        info!(
            "[{}] Connecting to mqtt broker {}:{}",
            self.name, options.host, options.port
        );
        let client = self.connector.open(&options);

        let connected = tokio::select! {
            biased;
            _ = stopped(stop) => {
                disconnect(&self.name, client.as_ref()).await;
                return Outcome::Shutdown;
            }
            result = client.connect() => result,
        };
        if let Err(error) = connected {
            disconnect(&self.name, client.as_ref()).await;
            return Outcome::Fault {
                error,
                recorded: false,
            };
        }
        debug!(
            "[{}] Connected to mqtt broker {}:{}",
            self.name, options.host, options.port
        );

        backoff.reset();
        if let Some(hosts) = hosts {
            hosts.reset();
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Session::new(client, epoch);
        *self.session.write().await = Some(session.clone());
        self.set_state(ProxyState::Connected);

        let started = tokio::select! {
            biased;
            _ = stopped(stop) => return Outcome::Shutdown,
            started = hook.on_connected(session) => started,
        };
        let mut activity: Activity = match started {
            Ok(activity) => activity,
            Err(error) => {
                return Outcome::Fault {
                    error,
                    recorded: false,
                }
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = stopped(stop) => {
                    activity.cancel().await;
                    return Outcome::Shutdown;
                }
                Some(fault) = faults.recv() => {
                    if fault.epoch != epoch {
                        continue;
                    }
                    if activity.is_finished() {
                        // The link failed on both sides at once; keep both failures.
                        if let Err(error) = (&mut activity).await {
                            let kind = error.kind();
                            warn!("[{}] {kind} error on background activity: {error}", self.name);
                            self.guard.lock().await.record(kind, error.to_string());
                        }
                    } else {
                        activity.cancel().await;
                    }
                    return Outcome::Fault { error: fault.error, recorded: true };
                }
                finished = &mut activity => {
                    let error = finished.err().unwrap_or_else(|| {
                        WireError::Network("connection closed".into())
                    });
                    return Outcome::Fault { error, recorded: false };
                }
            }
        }
    }

    /// Records the fault and decides between retrying (returns the delay)
    /// and giving up.
    async fn handle_fault(
        &self,
        host: &str,
        error: WireError,
        recorded: bool,
        hosts: Option<&mut HostSelector>,
        backoff: &mut Backoff,
    ) -> ProxyResult<Duration> {
        self.set_state(ProxyState::Faulted);
        let kind = error.kind();

        let verdict = {
            let mut guard = self.guard.lock().await;
            if !recorded {
                guard.record(kind, error.to_string());
            }
            guard.check()
        };
        if let Err(fatal) = verdict {
            if let ProxyError::FrequencyExceeded { history, .. } = &fatal {
                error!(
                    "[{}] Retry frequency threshold is exceeded: {:?}",
                    self.name,
                    history
                        .iter()
                        .map(|r| format!("{}: {}", r.kind, r.message))
                        .collect::<Vec<_>>()
                );
            }
            return Err(fatal);
        }

        if let Some(hosts) = hosts {
            match hosts.advance() {
                Ok(next) => debug!("[{}] Failing over from {host} to {next}", self.name),
                Err(fatal) => {
                    error!(
                        "[{}] Connection retry attempts exceeded ({}) for hosts {:?}",
                        self.name,
                        self.config.max_host_rotation_retries,
                        hosts.hosts()
                    );
                    return Err(fatal);
                }
            }
        }

        let interval = backoff.next_interval();
        warn!(
            "[{}] {kind} error on {host}: {error}. Retry in {} sec",
            self.name,
            interval.as_secs()
        );
        Ok(interval)
    }
}

async fn disconnect(name: &str, client: &dyn WireClient) {
    if !client.is_connected() {
        return;
    }
    if let Err(e) = client.disconnect().await {
        warn!("[{name}] Error while disconnecting: {e}");
    }
}

/// Resolves once shutdown has been requested.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}
