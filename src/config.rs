use std::time::Duration;

use serde::Deserialize;

use crate::logger::MessageLogMode;

pub const DEFAULT_TCP_PORT: u16 = 9999;
pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_MAX_PAGES: u32 = 20;

/// Connection settings for one gateway, typically loaded from the host
/// application's own config file. Durations are whole seconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub tcp_port: u16,
    pub http_port: u16,
    pub username: String,
    pub password: String,
    pub http_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub reconnect_backoff_secs: u64,
    pub inactivity_timeout_secs: u64,
    /// Poll period for the host's own scheduler; the client never polls.
    pub refresh_interval_secs: u64,
    pub max_pages: u32,
    /// Stop paging after a page shorter than this. Unset means only an
    /// empty page or the brand's device count ends the listing.
    pub page_size: Option<u32>,
    pub message_log_path: Option<String>,
    pub message_log_mode: MessageLogMode,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            tcp_port: DEFAULT_TCP_PORT,
            http_port: DEFAULT_HTTP_PORT,
            username: DEFAULT_USERNAME.to_string(),
            password: String::new(),
            http_timeout_secs: 10,
            connect_timeout_secs: 10,
            reconnect_backoff_secs: 10,
            inactivity_timeout_secs: 10,
            refresh_interval_secs: 60,
            max_pages: DEFAULT_MAX_PAGES,
            page_size: None,
            message_log_path: None,
            message_log_mode: MessageLogMode::Full,
        }
    }
}

impl GatewayConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}
