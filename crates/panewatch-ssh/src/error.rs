use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("ssh connect to {host}:{port} failed (pw={password_len} chars): {cause}")]
    Connect {
        host: String,
        port: u16,
        password_len: usize,
        cause: String,
    },
    #[error("server rejected credentials for {user}@{host}")]
    AuthRejected { user: String, host: String },
    #[error("not connected")]
    NotConnected,
    #[error("{operation} timed out after {after:?}")]
    ChannelTimeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("shell stream closed")]
    StreamClosed,
    #[error("reconnect gave up after {attempts} attempts: {last}")]
    ReconnectExhausted { attempts: u32, last: String },
    #[error("channel failed: {0}")]
    Channel(String),
}

impl SessionError {
    /// Errors that another connect attempt with the same credentials cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::AuthRejected { .. })
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
