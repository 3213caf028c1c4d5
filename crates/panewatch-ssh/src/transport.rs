//! Seams between the session logic and the SSH library.
//!
//! `RemoteSession` only talks to these traits; `russh_transport` provides the
//! real implementation and the integration tests provide in-memory fakes.

use crate::config::{Credentials, SessionConfig};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens and authenticates one connection.
    async fn connect(
        &self,
        credentials: &Credentials,
        config: &SessionConfig,
    ) -> Result<Arc<dyn Transport>>;
}

/// One authenticated connection able to multiplex channels.
#[async_trait]
pub trait Transport: Send + Sync {
    fn is_alive(&self) -> bool;

    async fn open_shell(&self) -> Result<Box<dyn ShellStream>>;

    /// Runs `command` on a fresh exec channel and returns its stdout once the
    /// channel closes.
    async fn exec(&self, command: &str) -> Result<String>;

    async fn close(&self);
}

#[async_trait]
pub trait ShellStream: Send {
    /// Next chunk of output, `Ok(None)` once the remote side closed the stream.
    ///
    /// Must be cancel-safe: the reader races it against input and shutdown.
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>>;

    async fn write_all(&mut self, data: &[u8]) -> Result<()>;

    async fn close(&mut self);
}
