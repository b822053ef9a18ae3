//! Configuration types for call setup

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for a call: signaling relay address, NAT-traversal
/// servers, and negotiation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// WebSocket signaling relay URL (ws:// or wss://)
    pub signaling_url: String,

    /// STUN/TURN server descriptors (at least one required)
    pub ice_servers: Vec<IceServerConfig>,

    /// Number of ICE candidates to pre-gather (default: 10)
    pub candidate_pool_size: u8,

    /// ICE transport policy (default: All)
    pub transport_policy: IceTransportPolicy,

    /// Connection watchdog window: time allowed from call start to an
    /// established connection (default: 45s)
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Bounded window for the pre-flight relay reachability probe
    /// (default: 10s)
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,

    /// Signaling reconnection tuning
    pub reconnect: ReconnectPolicy,
}

/// STUN or TURN server configuration
///
/// STUN entries carry only a URL; TURN entries additionally carry
/// credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URL (stun:, turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Credential for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// STUN entry (no credentials)
    pub fn stun(url: &str) -> Self {
        Self {
            url: url.to_string(),
            username: None,
            credential: None,
        }
    }

    /// TURN entry with credentials
    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            url: url.to_string(),
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }

    /// Whether this entry is a relay (TURN) server
    pub fn is_relay(&self) -> bool {
        self.url.starts_with("turn:") || self.url.starts_with("turns:")
    }
}

/// ICE transport policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    /// Use all candidate types (host, reflexive, relay)
    All,
    /// Force relayed candidates only
    Relay,
}

/// Signaling reconnection policy
///
/// Controls how the signaling client retries the relay connection after a
/// transport-level drop. Every successful reconnect re-emits `join-call`;
/// reconnects are never hidden from the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnection attempts (default: 5)
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds (default: 1000ms)
    pub backoff_initial_ms: u64,
    /// Maximum backoff delay in milliseconds (default: 5000ms)
    pub backoff_max_ms: u64,
    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,
    /// Whether to add jitter to backoff (default: true)
    pub jitter_enabled: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_initial_ms: 1000,
            backoff_max_ms: 5000,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

impl ReconnectPolicy {
    /// Calculate backoff duration for a given attempt number (0-indexed).
    ///
    /// Exponential backoff with optional jitter (0-25% of the delay).
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let backoff_ms =
            (self.backoff_initial_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff_ms.min(self.backoff_max_ms as f64);

        let final_ms = if self.jitter_enabled {
            use rand::Rng;
            let jitter = rand::thread_rng().gen_range(0.0..=backoff_ms * 0.25);
            backoff_ms + jitter
        } else {
            backoff_ms
        };

        Duration::from_millis(final_ms as u64)
    }

    /// Check if more retries are allowed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8080".to_string(),
            ice_servers: vec![
                IceServerConfig::stun("stun:stun.l.google.com:19302"),
                IceServerConfig::stun("stun:stun1.l.google.com:19302"),
                IceServerConfig::stun("stun:stun2.l.google.com:19302"),
            ],
            candidate_pool_size: 10,
            transport_policy: IceTransportPolicy::All,
            connect_timeout: Duration::from_secs(45),
            probe_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl CallConfig {
    /// Create a configuration pointing at the given signaling relay,
    /// keeping the default STUN list and tuning.
    pub fn new(signaling_url: &str) -> Self {
        Self {
            signaling_url: signaling_url.to_string(),
            ..Default::default()
        }
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `ice_servers` is empty
    /// - a `Relay` transport policy is requested without any TURN server
    /// - `signaling_url` is not a WebSocket URL
    /// - `connect_timeout` is zero
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.ice_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one ICE server is required".to_string(),
            ));
        }

        if self.transport_policy == IceTransportPolicy::Relay
            && !self.ice_servers.iter().any(|s| s.is_relay())
        {
            return Err(Error::InvalidConfig(
                "Relay transport policy requires at least one TURN server".to_string(),
            ));
        }

        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        if self.connect_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "connect_timeout must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<IceServerConfig>) -> Self {
        self.ice_servers.extend(turn_servers);
        self
    }

    /// Override the connection watchdog window
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the probe window
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
