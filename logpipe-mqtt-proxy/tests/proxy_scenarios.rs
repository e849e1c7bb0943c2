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

//! End-to-end behaviour of the connection proxy against the in-memory
//! connector.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use logpipe_mqtt_proxy::testing::{MockConnector, NeverDelay, RecordingDelay};
use logpipe_mqtt_proxy::{
    Activity, ConnectionHook, ConnectionProxy, FaultKind, ProxyConfig, ProxyError, ProxyState,
    QoS, Session, WireClient, WireError,
};
use tokio::sync::Notify;

struct Idle;

#[async_trait]
impl ConnectionHook for Idle {
    async fn on_connected(&self, session: Session) -> Result<Activity, WireError> {
        Ok(Activity::spawn(async move { session.receive(|_| {}).await }))
    }
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn refused() -> Result<(), WireError> {
    Err(WireError::Network("connection refused".into()))
}

fn proxy_with(
    config: ProxyConfig,
    connector: &MockConnector,
    delay: &RecordingDelay,
) -> ConnectionProxy {
    ConnectionProxy::builder("test", config, Arc::new(connector.clone()))
        .delay(Arc::new(delay.clone()))
        .build()
        .unwrap()
}

async fn wait_for_state(proxy: &ConnectionProxy, wanted: ProxyState) {
    let mut state = proxy.watch_state();
    tokio::time::timeout(secs(5), state.wait_for(|s| *s == wanted))
        .await
        .unwrap_or_else(|_| panic!("proxy never reached {wanted}"))
        .expect("state channel closed");
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

#[tokio::test]
async fn test_backoff_sequence_until_connected() {
    let connector = MockConnector::new();
    connector.script_connects((0..5).map(|_| refused()));
    let delay = RecordingDelay::new();
    let config = ProxyConfig::builder("broker")
        .backoff(1, 2, 8)
        .max_retry_frequency(100)
        .build();
    let proxy = proxy_with(config, &connector, &delay);

    proxy.start(Idle).await.unwrap();
    wait_for_state(&proxy, ProxyState::Connected).await;

    assert_eq!(
        delay.delays(),
        vec![secs(1), secs(2), secs(4), secs(8), secs(8)]
    );
    assert_eq!(connector.attempts().len(), 6);

    proxy.shutdown().await.unwrap();
    assert_eq!(proxy.state(), ProxyState::Closed);
    assert!(!connector.latest().unwrap().is_connected());
}

#[tokio::test]
async fn test_frequency_threshold_is_fatal() {
    let connector = MockConnector::refusing();
    let delay = RecordingDelay::new();
    let config = ProxyConfig::builder("broker")
        .backoff(1, 2, 8)
        .max_retry_frequency(3)
        .build();
    let proxy = proxy_with(config, &connector, &delay);

    proxy.start(Idle).await.unwrap();
    let fatal = tokio::time::timeout(secs(5), proxy.closed())
        .await
        .unwrap()
        .expect("proxy should have failed");

    match &fatal {
        ProxyError::FrequencyExceeded { count, max, history } => {
            assert_eq!(*count, 4);
            assert_eq!(*max, 3);
            assert!(history.iter().all(|r| r.kind == FaultKind::Network));
        }
        other => panic!("expected FrequencyExceeded, got {other:?}"),
    }
    assert!(fatal.is_fatal());
    assert_eq!(connector.attempts().len(), 4);
    assert_eq!(delay.delays().len(), 3);
    assert_eq!(proxy.failure_history().await.len(), 4);

    let publish = proxy
        .publish_through("t", b"x".to_vec(), false, QoS::AtMostOnce)
        .await;
    assert_eq!(publish, Err(fatal.clone()));
    assert_eq!(proxy.shutdown().await, Err(fatal));
}

#[tokio::test]
async fn test_host_rotation_exhaustion() {
    let connector = MockConnector::refusing();
    let delay = RecordingDelay::new();
    let config = ProxyConfig::builder("unused")
        .ha_hosts(["h1", "h2", "h3"])
        .max_host_rotation_retries(2)
        .build();
    let proxy = proxy_with(config, &connector, &delay);

    proxy.start(Idle).await.unwrap();
    let fatal = tokio::time::timeout(secs(5), proxy.closed())
        .await
        .unwrap();

    assert_eq!(
        fatal,
        Some(ProxyError::RotationExhausted {
            hosts: vec!["h1".into(), "h2".into(), "h3".into()],
            max_retries: 2,
        })
    );
    assert_eq!(connector.attempted_hosts(), vec!["h1", "h2", "h3"]);
}

#[tokio::test]
async fn test_rotation_resumes_from_last_good_host() {
    let connector = MockConnector::new();
    connector.script_connects([refused()]);
    let delay = RecordingDelay::new();
    let config = ProxyConfig::builder("unused")
        .ha_hosts(["h1", "h2", "h3"])
        .max_host_rotation_retries(1)
        .build();
    let proxy = proxy_with(config, &connector, &delay);

    proxy.start(Idle).await.unwrap();
    wait_for_state(&proxy, ProxyState::Connected).await;
    assert_eq!(connector.attempted_hosts(), vec!["h1", "h2"]);

    // the rotation budget was reset by the successful connect to h2
    connector
        .latest()
        .unwrap()
        .break_link(WireError::Network("reset by peer".into()));
    eventually(|| connector.attempts().len() == 3).await;
    wait_for_state(&proxy, ProxyState::Connected).await;
    assert_eq!(connector.attempted_hosts(), vec!["h1", "h2", "h3"]);

    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_success_resets_backoff_but_not_failure_window() {
    let connector = MockConnector::new();
    connector.script_connects((0..3).map(|_| refused()));
    let delay = RecordingDelay::new();
    let config = ProxyConfig::builder("broker").backoff(1, 2, 8).build();
    let proxy = proxy_with(config, &connector, &delay);

    proxy.start(Idle).await.unwrap();
    wait_for_state(&proxy, ProxyState::Connected).await;
    assert_eq!(delay.delays(), vec![secs(1), secs(2), secs(4)]);
    assert_eq!(proxy.failure_history().await.len(), 3);

    connector
        .latest()
        .unwrap()
        .break_link(WireError::Network("reset by peer".into()));
    eventually(|| connector.attempts().len() == 5).await;
    wait_for_state(&proxy, ProxyState::Connected).await;

    assert_eq!(delay.delays(), vec![secs(1), secs(2), secs(4), secs(1)]);
    assert_eq!(proxy.failure_history().await.len(), 4);

    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_publish_on_dropped_link_is_not_retried() {
    let connector = MockConnector::new();
    connector.script_publishes([Err(WireError::NotConnected)]);
    let delay = RecordingDelay::new();
    let proxy = proxy_with(ProxyConfig::default(), &connector, &delay);

    proxy.start(Idle).await.unwrap();
    wait_for_state(&proxy, ProxyState::Connected).await;

    let result = proxy
        .publish_through("logs/app", b"{}".to_vec(), false, QoS::AtLeastOnce)
        .await;
    assert_eq!(result, Err(ProxyError::NotConnected));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(proxy.failure_history().await.is_empty());
    assert_eq!(connector.attempts().len(), 1);
    assert!(delay.delays().is_empty());
    assert_eq!(proxy.state(), ProxyState::Connected);

    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_publish_fault_reconnects_once() {
    let connector = MockConnector::new();
    connector.script_publishes([Err(WireError::Timeout("no puback".into()))]);
    let delay = RecordingDelay::new();
    let proxy = proxy_with(ProxyConfig::default(), &connector, &delay);

    proxy.start(Idle).await.unwrap();
    wait_for_state(&proxy, ProxyState::Connected).await;

    let result = proxy
        .publish_through("logs/app", b"{}".to_vec(), false, QoS::AtLeastOnce)
        .await;
    assert_eq!(
        result,
        Err(ProxyError::Publish {
            kind: FaultKind::Timeout,
            message: "timed out: no puback".into(),
        })
    );

    eventually(|| connector.attempts().len() == 2).await;
    wait_for_state(&proxy, ProxyState::Connected).await;

    let history = proxy.failure_history().await;
    assert_eq!(history.len(), 1, "publish fault must be counted once");
    assert_eq!(history[0].kind, FaultKind::Timeout);
    assert_eq!(delay.delays(), vec![secs(1)]);
    assert_eq!(connector.clients()[0].disconnects(), 1);

    proxy
        .publish_through("logs/app", b"{\"a\":1}".to_vec(), true, QoS::AtLeastOnce)
        .await
        .unwrap();
    assert_eq!(
        connector.published(),
        vec![(
            "logs/app".to_string(),
            b"{\"a\":1}".to_vec(),
            true,
            QoS::AtLeastOnce
        )]
    );

    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_publish_before_start() {
    let connector = MockConnector::new();
    let proxy = ConnectionProxy::builder("test", ProxyConfig::default(), Arc::new(connector))
        .build()
        .unwrap();
    let result = proxy
        .publish_through("t", b"x".to_vec(), false, QoS::AtMostOnce)
        .await;
    assert_eq!(result, Err(ProxyError::NotConnected));
}

#[tokio::test]
async fn test_wildcard_topic_is_rejected_without_fault() {
    let connector = MockConnector::new();
    let delay = RecordingDelay::new();
    let proxy = proxy_with(ProxyConfig::default(), &connector, &delay);

    proxy.start(Idle).await.unwrap();
    wait_for_state(&proxy, ProxyState::Connected).await;

    let result = proxy
        .publish_through("logs/#", b"x".to_vec(), false, QoS::AtMostOnce)
        .await;
    assert_eq!(result, Err(ProxyError::InvalidTopic("logs/#".into())));
    assert!(connector.published().is_empty());
    assert!(proxy.failure_history().await.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(proxy.state(), ProxyState::Connected);
    assert_eq!(connector.attempts().len(), 1);
    proxy.shutdown().await.unwrap();
}

/// Background activity that fails once `trip` is notified, on the first
/// connection only.
struct Tripwire {
    trip: Arc<Notify>,
    connects: AtomicUsize,
}

#[async_trait]
impl ConnectionHook for Tripwire {
    async fn on_connected(&self, session: Session) -> Result<Activity, WireError> {
        if self.connects.fetch_add(1, Ordering::SeqCst) > 0 {
            return Ok(Activity::spawn(async move { session.receive(|_| {}).await }));
        }
        let trip = self.trip.clone();
        Ok(Activity::spawn(async move {
            trip.notified().await;
            Err::<(), WireError>(WireError::Protocol("malformed packet".into()))
        }))
    }
}

#[tokio::test]
async fn test_simultaneous_faults_are_both_recorded_with_one_reconnect() {
    let connector = MockConnector::new();
    connector.script_publishes([Err(WireError::Timeout("no puback".into()))]);
    let delay = RecordingDelay::new();
    let proxy = proxy_with(ProxyConfig::default(), &connector, &delay);
    let trip = Arc::new(Notify::new());

    proxy
        .start(Tripwire {
            trip: trip.clone(),
            connects: AtomicUsize::new(0),
        })
        .await
        .unwrap();
    wait_for_state(&proxy, ProxyState::Connected).await;
    assert_eq!(connector.attempts().len(), 1);

    // Both sides fail before the owner task gets to run.
    trip.notify_one();
    let result = proxy
        .publish_through("logs/app", b"x".to_vec(), false, QoS::AtLeastOnce)
        .await;
    assert!(matches!(
        result,
        Err(ProxyError::Publish {
            kind: FaultKind::Timeout,
            ..
        })
    ));

    eventually(|| connector.attempts().len() == 2).await;
    wait_for_state(&proxy, ProxyState::Connected).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let kinds: Vec<FaultKind> = proxy
        .failure_history()
        .await
        .iter()
        .map(|r| r.kind)
        .collect();
    assert_eq!(kinds.len(), 2);
    assert!(kinds.contains(&FaultKind::Timeout));
    assert!(kinds.contains(&FaultKind::Protocol));
    assert_eq!(connector.attempts().len(), 2);
    assert_eq!(delay.delays(), vec![secs(1)]);

    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_interrupts_backoff() {
    let connector = MockConnector::refusing();
    let proxy = ConnectionProxy::builder(
        "test",
        ProxyConfig::default(),
        Arc::new(connector.clone()),
    )
    .delay(Arc::new(NeverDelay))
    .build()
    .unwrap();

    proxy.start(Idle).await.unwrap();
    wait_for_state(&proxy, ProxyState::Faulted).await;

    tokio::time::timeout(secs(5), proxy.shutdown())
        .await
        .expect("shutdown must not wait for the backoff delay")
        .unwrap();
    assert_eq!(proxy.state(), ProxyState::Closed);
    assert_eq!(connector.attempts().len(), 1);
}

#[tokio::test]
async fn test_shutdown_disconnects_and_stops_reconnecting() {
    let connector = MockConnector::new();
    let delay = RecordingDelay::new();
    let proxy = proxy_with(ProxyConfig::default(), &connector, &delay);

    proxy.start(Idle).await.unwrap();
    wait_for_state(&proxy, ProxyState::Connected).await;
    proxy.shutdown().await.unwrap();

    let client = connector.latest().unwrap();
    assert!(!client.is_connected());
    assert_eq!(client.disconnects(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.attempts().len(), 1);
    assert!(delay.delays().is_empty());
    assert!(proxy.closed().await.is_none());
}

#[tokio::test]
async fn test_start_twice() {
    let connector = MockConnector::new();
    let delay = RecordingDelay::new();
    let proxy = proxy_with(ProxyConfig::default(), &connector, &delay);

    proxy.start(Idle).await.unwrap();
    assert_eq!(proxy.start(Idle).await, Err(ProxyError::AlreadyStarted));
    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_is_rejected_at_build() {
    let config = ProxyConfig::builder("broker").backoff(10, 2, 5).build();
    let result = ConnectionProxy::builder("test", config, Arc::new(MockConnector::new())).build();
    assert!(matches!(result, Err(ProxyError::Config(_))));
}

struct FlakyHook {
    calls: AtomicUsize,
}

#[async_trait]
impl ConnectionHook for FlakyHook {
    async fn on_connected(&self, session: Session) -> Result<Activity, WireError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(WireError::Protocol("suback refused".into()));
        }
        Ok(Activity::spawn(async move { session.receive(|_| {}).await }))
    }
}

#[tokio::test]
async fn test_hook_failure_is_a_fault() {
    let connector = MockConnector::new();
    let delay = RecordingDelay::new();
    let proxy = proxy_with(ProxyConfig::default(), &connector, &delay);

    proxy
        .start(FlakyHook {
            calls: AtomicUsize::new(0),
        })
        .await
        .unwrap();
    eventually(|| connector.attempts().len() == 2).await;
    wait_for_state(&proxy, ProxyState::Connected).await;

    let history = proxy.failure_history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].kind, FaultKind::Protocol);
    assert_eq!(connector.clients()[0].disconnects(), 1);

    proxy.shutdown().await.unwrap();
}

struct ShortLived;

#[async_trait]
impl ConnectionHook for ShortLived {
    async fn on_connected(&self, _session: Session) -> Result<Activity, WireError> {
        Ok(Activity::spawn(async { Ok::<(), WireError>(()) }))
    }
}

#[tokio::test]
async fn test_finished_activity_counts_as_closed_link() {
    let connector = MockConnector::new();
    let delay = RecordingDelay::new();
    let config = ProxyConfig::builder("broker").max_retry_frequency(2).build();
    let proxy = proxy_with(config, &connector, &delay);

    proxy.start(ShortLived).await.unwrap();
    let fatal = tokio::time::timeout(secs(5), proxy.closed())
        .await
        .unwrap();

    match fatal {
        Some(ProxyError::FrequencyExceeded { history, .. }) => {
            assert_eq!(history.len(), 3);
            assert!(history.iter().all(|r| r.kind == FaultKind::Network));
        }
        other => panic!("expected FrequencyExceeded, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connection_options_per_attempt() {
    let connector = MockConnector::new();
    connector.script_connects([refused()]);
    let delay = RecordingDelay::new();
    let config = ProxyConfig::builder("broker")
        .port(8883)
        .credentials("svc", "pw")
        .build();
    let proxy = proxy_with(config, &connector, &delay);

    proxy.start(Idle).await.unwrap();
    wait_for_state(&proxy, ProxyState::Connected).await;

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 2);
    assert!(attempts[0].client_id.starts_with("test-"));
    assert_eq!(attempts[0].client_id, attempts[1].client_id);
    assert_eq!(attempts[1].port, 8883);
    assert_eq!(
        attempts[1].credentials.as_ref().map(|c| c.username.as_str()),
        Some("svc")
    );

    proxy.shutdown().await.unwrap();
}
