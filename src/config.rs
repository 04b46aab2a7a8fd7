//! Client configuration

use std::time::Duration;

use crate::utils::BackoffOptions;

/// Production REST API host.
pub const DEFAULT_API_HOST: &str = "api-global-prod.aircloudhome.com";

/// Production push-notification host.
pub const DEFAULT_NOTIFICATION_HOST: &str = "notification-global-prod.aircloudhome.com";

/// Reconnect policy applied after an unexpected push-channel close.
#[derive(Debug, Clone)]
pub struct ReconnectOptions {
    pub backoff: BackoffOptions,

    /// Give up after this many failed attempts.
    pub max_attempts: u32,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffOptions::default(),
            max_attempts: 10,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// REST API host.
    pub api_host: String,

    /// REST API port.
    pub api_port: u16,

    /// Push-notification (websocket) host.
    pub notification_host: String,

    /// Interval between command status poll batches.
    pub command_poll_interval: Duration,

    /// How long a dispatched command may wait for acknowledgement.
    pub ack_timeout: Duration,

    /// Client heartbeat interval on the push channel.
    pub heartbeat_interval: Duration,

    /// Reconnect policy for the push channel.
    pub reconnect: ReconnectOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_host: DEFAULT_API_HOST.to_string(),
            api_port: 443,
            notification_host: DEFAULT_NOTIFICATION_HOST.to_string(),
            command_poll_interval: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            reconnect: ReconnectOptions::default(),
        }
    }
}
