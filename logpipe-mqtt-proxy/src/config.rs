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

//! Configuration types for the connection proxy.

use std::path::PathBuf;
use std::time::Duration;

use rumqttc::QoS;
use serde::Deserialize;

use crate::error::ProxyError;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 1883;

/// Connection and retry settings shared by the MQTT input and output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Broker hostname or IP, used when `ha_hosts` is not set.
    pub host: String,
    /// Candidate brokers for failover. Takes precedence over `host`.
    pub ha_hosts: Option<Vec<String>>,
    pub port: u16,
    /// MQTT client ID. Generated once per proxy when absent.
    pub client_id: Option<String>,
    pub clean_session: bool,
    /// Keep-alive interval in seconds.
    pub keep_alive: u64,
    /// First reconnect delay in seconds.
    pub initial_interval: u64,
    #[serde(alias = "retry_inc_ratio")]
    pub retry_growth_ratio: u32,
    /// Reconnect delay ceiling in seconds.
    pub max_retry_interval: u64,
    /// Failures tolerated within one minute before giving up.
    #[serde(alias = "max_retry_freq")]
    pub max_retry_frequency: usize,
    #[serde(alias = "max_ha_connect_retries")]
    pub max_host_rotation_retries: u32,
    pub security: Option<SecurityConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            ha_hosts: None,
            port: DEFAULT_PORT,
            client_id: None,
            clean_session: true,
            keep_alive: 15,
            initial_interval: 1,
            retry_growth_ratio: 2,
            max_retry_interval: 300,
            max_retry_frequency: 10,
            max_host_rotation_retries: 10,
            security: None,
        }
    }
}

/// Optional authentication and TLS settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

/// Everything a wire client needs for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub credentials: Option<Credentials>,
    pub tls: Option<TlsOptions>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// TLS material. All paths empty means the platform's default roots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl ProxyConfig {
    /// Start building a config for a single broker host.
    pub fn builder(host: impl Into<String>) -> ProxyConfigBuilder {
        ProxyConfigBuilder {
            config: ProxyConfig {
                host: host.into(),
                ..ProxyConfig::default()
            },
        }
    }

    /// Rejects settings the retry loop cannot work with.
    pub fn validate(&self) -> Result<(), ProxyError> {
        let invalid = |msg: String| Err(ProxyError::Config(msg));

        if self.initial_interval < 1 {
            return invalid("initial_interval must be at least 1 second".into());
        }
        if self.retry_growth_ratio < 1 {
            return invalid("retry_growth_ratio must be at least 1".into());
        }
        if self.max_retry_interval < self.initial_interval {
            return invalid(format!(
                "max_retry_interval ({}) must not be below initial_interval ({})",
                self.max_retry_interval, self.initial_interval
            ));
        }
        if self.keep_alive > u64::from(u16::MAX) {
            return invalid(format!(
                "keep_alive ({}) must not exceed {} seconds",
                self.keep_alive,
                u16::MAX
            ));
        }
        if self.max_retry_frequency < 1 {
            return invalid("max_retry_frequency must be at least 1".into());
        }
        match &self.ha_hosts {
            Some(hosts) if hosts.is_empty() => {
                return invalid("ha_hosts must list at least one host".into());
            }
            Some(hosts) if hosts.iter().any(|h| h.trim().is_empty()) => {
                return invalid("ha_hosts contains an empty host".into());
            }
            None if self.host.trim().is_empty() => {
                return invalid("host must not be empty".into());
            }
            _ => {}
        }
        if let Some(tls) = self.security.as_ref().and_then(|s| s.tls.as_ref()) {
            if tls.cert_file.is_some() != tls.key_file.is_some() {
                return invalid("tls cert_file and key_file must be set together".into());
            }
        }
        Ok(())
    }

    /// Candidate hosts when failover is configured.
    pub fn failover_hosts(&self) -> Option<&[String]> {
        self.ha_hosts.as_deref()
    }

    pub fn initial_interval(&self) -> Duration {
        Duration::from_secs(self.initial_interval)
    }

    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_secs(self.max_retry_interval)
    }

    /// Configured client ID, or `{name}-{uuid}` when none is set.
    pub fn resolve_client_id(&self, name: &str) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("{name}-{}", uuid::Uuid::new_v4()))
    }

    /// Options for connecting to `host`. Credentials and TLS are only
    /// present when configured.
    pub fn connection_options(&self, host: &str, client_id: &str) -> ConnectionOptions {
        let security = self.security.as_ref();
        let credentials = security.and_then(|s| {
            s.username.as_ref().map(|username| Credentials {
                username: username.clone(),
                password: s.password.clone().unwrap_or_default(),
            })
        });
        let tls = security.filter(|s| s.use_tls).map(|s| {
            let files = s.tls.clone().unwrap_or_default();
            TlsOptions {
                ca_file: files.ca_file,
                cert_file: files.cert_file,
                key_file: files.key_file,
            }
        });

        ConnectionOptions {
            host: host.to_string(),
            port: self.port,
            client_id: client_id.to_string(),
            clean_session: self.clean_session,
            keep_alive: Duration::from_secs(self.keep_alive),
            credentials,
            tls,
        }
    }
}

/// Builder for [`ProxyConfig`].
pub struct ProxyConfigBuilder {
    config: ProxyConfig,
}

impl ProxyConfigBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn ha_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.ha_hosts = Some(hosts.into_iter().map(Into::into).collect());
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = Some(client_id.into());
        self
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.config.clean_session = clean_session;
        self
    }

    pub fn keep_alive(mut self, secs: u64) -> Self {
        self.config.keep_alive = secs;
        self
    }

    /// Initial delay, growth ratio and ceiling of the reconnect backoff.
    pub fn backoff(mut self, initial_secs: u64, ratio: u32, max_secs: u64) -> Self {
        self.config.initial_interval = initial_secs;
        self.config.retry_growth_ratio = ratio;
        self.config.max_retry_interval = max_secs;
        self
    }

    pub fn max_retry_frequency(mut self, max: usize) -> Self {
        self.config.max_retry_frequency = max;
        self
    }

    pub fn max_host_rotation_retries(mut self, max: u32) -> Self {
        self.config.max_host_rotation_retries = max;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        let security = self.config.security.get_or_insert_with(SecurityConfig::default);
        security.username = Some(username.into());
        security.password = Some(password.into());
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        let security = self.config.security.get_or_insert_with(SecurityConfig::default);
        security.use_tls = true;
        security.tls = Some(tls);
        self
    }

    pub fn build(self) -> ProxyConfig {
        self.config
    }
}

/// Converts a configured QoS level (0, 1 or 2).
pub fn parse_qos(level: u8) -> Result<QoS, ProxyError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(ProxyError::Config(format!("invalid qos level {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: ProxyConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ProxyConfig::default());
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 1883);
        assert_eq!(config.keep_alive, 15);
        assert_eq!(config.max_retry_interval, 300);
        assert_eq!(config.max_retry_frequency, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_legacy_field_names() {
        let config: ProxyConfig = serde_json::from_str(
            r#"{"retry_inc_ratio": 3, "max_retry_freq": 5, "max_ha_connect_retries": 4}"#,
        )
        .unwrap();
        assert_eq!(config.retry_growth_ratio, 3);
        assert_eq!(config.max_retry_frequency, 5);
        assert_eq!(config.max_host_rotation_retries, 4);
    }

    #[test]
    fn test_security_section() {
        let config: ProxyConfig = serde_json::from_str(
            r#"{
                "security": {
                    "username": "alice",
                    "password": "secret",
                    "use_tls": true,
                    "tls": {"ca_file": "/etc/ca.pem"}
                }
            }"#,
        )
        .unwrap();
        let opts = config.connection_options("broker", "cid");
        assert_eq!(
            opts.credentials,
            Some(Credentials {
                username: "alice".into(),
                password: "secret".into()
            })
        );
        let tls = opts.tls.expect("tls enabled");
        assert_eq!(tls.ca_file, Some(PathBuf::from("/etc/ca.pem")));
        assert!(tls.cert_file.is_none());
    }

    #[test]
    fn test_tls_section_ignored_unless_enabled() {
        let config = ProxyConfig {
            security: Some(SecurityConfig {
                tls: Some(TlsConfig {
                    ca_file: Some("/etc/ca.pem".into()),
                    ..TlsConfig::default()
                }),
                ..SecurityConfig::default()
            }),
            ..ProxyConfig::default()
        };
        let opts = config.connection_options("broker", "cid");
        assert!(opts.tls.is_none());
        assert!(opts.credentials.is_none());
    }

    #[test]
    fn test_builder() {
        let config = ProxyConfig::builder("broker.local")
            .port(8883)
            .client_id("fixed")
            .keep_alive(30)
            .backoff(2, 3, 60)
            .credentials("bob", "pw")
            .build();
        assert!(config.validate().is_ok());

        let opts = config.connection_options("broker.local", &config.resolve_client_id("in"));
        assert_eq!(opts.host, "broker.local");
        assert_eq!(opts.port, 8883);
        assert_eq!(opts.client_id, "fixed");
        assert_eq!(opts.keep_alive, Duration::from_secs(30));
        assert_eq!(config.initial_interval(), Duration::from_secs(2));
        assert_eq!(config.max_retry_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_generated_client_id() {
        let config = ProxyConfig::default();
        let id = config.resolve_client_id("mqtt-in");
        assert!(id.starts_with("mqtt-in-"));
        assert_ne!(id, config.resolve_client_id("mqtt-in"));
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            ProxyConfig::builder("h").backoff(0, 2, 10).build(),
            ProxyConfig::builder("h").backoff(1, 0, 10).build(),
            ProxyConfig::builder("h").backoff(10, 2, 5).build(),
            ProxyConfig::builder("h").max_retry_frequency(0).build(),
            ProxyConfig::builder("h").keep_alive(65_536).build(),
            ProxyConfig::builder("h").ha_hosts(Vec::<String>::new()).build(),
            ProxyConfig::builder("h").ha_hosts(["a", " "]).build(),
            ProxyConfig::builder("").build(),
            ProxyConfig::builder("h")
                .tls(TlsConfig {
                    cert_file: Some("/c.pem".into()),
                    ..TlsConfig::default()
                })
                .build(),
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(ProxyError::Config(_))),
                "{config:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_keep_alive_upper_bound() {
        let config = ProxyConfig::builder("h").keep_alive(u64::from(u16::MAX)).build();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ha_hosts_override_empty_host() {
        let config = ProxyConfig::builder("").ha_hosts(["h1", "h2"]).build();
        assert!(config.validate().is_ok());
        assert_eq!(config.failover_hosts().unwrap().len(), 2);
    }

    #[test]
    fn test_parse_qos() {
        assert_eq!(parse_qos(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(parse_qos(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(parse_qos(2).unwrap(), QoS::ExactlyOnce);
        assert!(parse_qos(3).is_err());
    }
}
