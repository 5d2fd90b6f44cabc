//! Client configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::{
    constants::*,
    error::{EslError, EslResult},
    subscription::Subscriptions,
};

/// What to do when the switch keeps rejecting `auth`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthRetryPolicy {
    /// Consecutive rejections tolerated before the client stops for good.
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl AuthRetryPolicy {
    pub fn forever() -> Self {
        Self { max_attempts: None }
    }

    pub fn limited(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
        }
    }

    /// `true` once `failures` consecutive rejections exhaust the policy
    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.max_attempts
            .map_or(false, |max| failures >= max)
    }
}

/// Settings for [`EslClient`](crate::EslClient).
///
/// Durations are in milliseconds so the struct maps one-to-one onto a JSON
/// document; a value of 0 disables the optional timeouts.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `host:port` of the event socket
    pub address: String,
    pub password: String,
    pub subscriptions: Subscriptions,
    /// Capacity of the consumer-facing event channel
    pub event_queue_size: usize,
    /// Dial timeout, also applied to each handshake read and command write
    pub connect_timeout_ms: u64,
    /// Fixed pause between reconnect attempts
    pub reconnect_delay_ms: u64,
    /// How long a full event channel is waited on before the event is dropped
    pub dispatch_timeout_ms: u64,
    /// Reply wait per command; 0 waits until the reply or a disconnect
    pub command_timeout_ms: u64,
    /// Inbound silence tolerated before reconnecting; 0 disables
    pub liveness_timeout_ms: u64,
    pub auth_retry: AuthRetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            subscriptions: Subscriptions::default(),
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            dispatch_timeout_ms: DEFAULT_DISPATCH_TIMEOUT_MS,
            command_timeout_ms: 0,
            liveness_timeout_ms: 0,
            auth_retry: AuthRetryPolicy::forever(),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("address", &self.address)
            .field("password", &"[REDACTED]")
            .field("subscriptions", &self.subscriptions)
            .field("event_queue_size", &self.event_queue_size)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .field("dispatch_timeout_ms", &self.dispatch_timeout_ms)
            .field("command_timeout_ms", &self.command_timeout_ms)
            .field("liveness_timeout_ms", &self.liveness_timeout_ms)
            .field("auth_retry", &self.auth_retry)
            .finish()
    }
}

fn optional(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl ClientConfig {
    pub fn new(address: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a JSON document; missing keys take their defaults.
    pub fn from_json(json: &str) -> EslResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EslResult<()> {
        if self
            .address
            .trim()
            .is_empty()
        {
            return Err(EslError::invalid_config("address must not be empty"));
        }
        if self.reconnect_delay_ms == 0 {
            return Err(EslError::invalid_config(
                "reconnect_delay_ms must be greater than zero",
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(EslError::invalid_config(
                "connect_timeout_ms must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn with_subscriptions(mut self, subscriptions: Subscriptions) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    pub fn with_filter(mut self, expression: impl Into<String>) -> Self {
        self.subscriptions = self
            .subscriptions
            .filter(expression);
        self
    }

    pub fn with_event(mut self, class: impl Into<String>) -> Self {
        self.subscriptions = self
            .subscriptions
            .event(class);
        self
    }

    pub fn with_event_queue_size(mut self, size: usize) -> Self {
        self.event_queue_size = size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_auth_retry(mut self, policy: AuthRetryPolicy) -> Self {
        self.auth_retry = policy;
        self
    }

    /// Channel capacity, never below one
    pub fn queue_size(&self) -> usize {
        self.event_queue_size
            .max(1)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        optional(self.command_timeout_ms)
    }

    pub fn liveness_timeout(&self) -> Option<Duration> {
        optional(self.liveness_timeout_ms)
    }
}
