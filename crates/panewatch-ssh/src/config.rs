use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Login material kept by a session so reconnects never ask again.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// When set, only public-key auth is attempted.
    pub key_path: Option<PathBuf>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            key_path: None,
            password: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_key_path(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn password_len(&self) -> usize {
        self.password
            .as_deref()
            .map(|password| password.chars().count())
            .unwrap_or(0)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("key_path", &self.key_path)
            .field("password_len", &self.password_len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    /// Pause between attempts; not applied after the last one.
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    /// Bound on opening a channel and sending its shell/exec request.
    pub channel_timeout: Duration,
    /// Bound on a whole one-shot command, including waiting for it to finish.
    pub command_timeout: Duration,
    pub keepalive_interval: Duration,
    pub reconnect: ReconnectPolicy,
    /// Wait between typing text into a pane and pressing Enter.
    pub enter_delay: Duration,
    /// Wait after Enter before the pane is worth re-reading.
    pub settle_delay: Duration,
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            channel_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(15),
            reconnect: ReconnectPolicy::default(),
            enter_delay: Duration::from_millis(300),
            settle_delay: Duration::from_secs(1),
            event_capacity: 256,
        }
    }
}
