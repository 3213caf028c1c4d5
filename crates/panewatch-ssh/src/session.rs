use crate::config::{Credentials, SessionConfig};
use crate::error::{Result, SessionError};
use crate::events::{PollOutcome, SessionEvent};
use crate::reconnect::ReconnectSupervisor;
use crate::shell::ShellHandle;
use crate::transport::{Connector, Transport};
use panewatch_core::panes::{send_enter_command, send_text_command};
use panewatch_core::{parse_pane_batch, parse_usage_report, shell_quote, PaneQuery, UsageReport};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Owner of one SSH connection, its interactive shell and the exec channels
/// built on top of it.
///
/// Cloning is cheap and every clone drives the same connection. The
/// connection is torn down by [`RemoteSession::disconnect`] or once the last
/// clone is dropped.
#[derive(Clone)]
pub struct RemoteSession {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    state: Mutex<State>,
    /// Held across a whole connect or reconnect attempt so only one of them
    /// builds a transport at a time. Taken before `state`.
    rebuild: Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
    loss_tx: mpsc::UnboundedSender<u64>,
    generation: AtomicU64,
    poll_in_flight: AtomicBool,
    reconnecting: AtomicBool,
    shutdown: CancellationToken,
}

struct State {
    credentials: Option<Credentials>,
    transport: Option<Arc<dyn Transport>>,
    shell: Option<ShellHandle>,
    /// Cancelled by an explicit disconnect so a running reconnect stops.
    link: CancellationToken,
    loss_rx: Option<mpsc::UnboundedReceiver<u64>>,
}

/// Clears an atomic flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlagGuard(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RemoteSession {
    pub fn new(connector: impl Connector, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (loss_tx, loss_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                connector: Arc::new(connector),
                config,
                state: Mutex::new(State {
                    credentials: None,
                    transport: None,
                    shell: None,
                    link: CancellationToken::new(),
                    loss_rx: Some(loss_rx),
                }),
                rebuild: Mutex::new(()),
                events,
                loss_tx,
                generation: AtomicU64::new(0),
                poll_in_flight: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Connects and opens the interactive shell.
    ///
    /// A session that is already connected returns `Ok` without opening a
    /// second transport. Failures here are returned directly; only losses
    /// after a successful connect are retried in the background.
    pub async fn connect(&self, credentials: Credentials) -> Result<()> {
        let _rebuild = self.inner.rebuild.lock().await;
        let mut state = self.inner.state.lock().await;
        if state.is_live() {
            debug!(host = %credentials.host, "ssh_connect_noop");
            return Ok(());
        }

        if let Some(shell) = state.shell.take() {
            shell.shutdown().await;
        }
        if let Some(stale) = state.transport.take() {
            stale.close().await;
        }

        let transport = self.inner.establish(&credentials).await?;
        let shell = match self.inner.open_shell(&transport).await {
            Ok(shell) => shell,
            Err(err) => {
                transport.close().await;
                return Err(err);
            }
        };

        state.transport = Some(transport);
        state.shell = Some(shell);
        state.credentials = Some(credentials);
        if state.link.is_cancelled() {
            state.link = CancellationToken::new();
        }
        if let Some(loss_rx) = state.loss_rx.take() {
            spawn_watcher(&self.inner, loss_rx);
        }
        drop(state);

        let _ = self.inner.events.send(SessionEvent::Connected);
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.is_live()
    }

    /// Stops the reader, closes the shell, then closes the transport.
    /// Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let (shell, transport) = {
            let mut state = self.inner.state.lock().await;
            state.credentials = None;
            state.link.cancel();
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            (state.shell.take(), state.transport.take())
        };

        let was_open = shell.is_some() || transport.is_some();
        if let Some(shell) = shell {
            shell.shutdown().await;
        }
        if let Some(transport) = transport {
            transport.close().await;
        }
        if was_open {
            info!("ssh_disconnected");
            let _ = self.inner.events.send(SessionEvent::Closed);
        }
    }

    /// Writes `text` plus a newline to the interactive shell.
    pub async fn send_raw(&self, text: &str) -> Result<()> {
        let state = self.inner.state.lock().await;
        let shell = state.shell.as_ref().ok_or(SessionError::NotConnected)?;
        shell.send_command(text).await;
        Ok(())
    }

    /// Runs a one-shot command and returns its stdout. Never reconnects.
    pub async fn exec(&self, command: &str) -> Result<String> {
        let transport = self.inner.live_transport().await?;
        let limit = self.inner.config.command_timeout;
        match tokio::time::timeout(limit, transport.exec(command)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(after = ?limit, "ssh_exec_timeout");
                Err(SessionError::ChannelTimeout {
                    operation: "exec",
                    after: limit,
                })
            }
        }
    }

    /// Fetches identity and content of every pane in `indices` with one exec.
    ///
    /// Returns `PollOutcome::Skipped` without touching the connection when
    /// another batch poll is still running.
    pub async fn poll_panes_batch(
        &self,
        query: &PaneQuery,
        indices: &[usize],
    ) -> Result<PollOutcome> {
        let Some(_in_flight) = FlagGuard::acquire(&self.inner.poll_in_flight) else {
            debug!("pane_poll_skipped_in_flight");
            return Ok(PollOutcome::Skipped);
        };

        let output = self.exec(&query.batch_script(indices)).await?;
        let batch = parse_pane_batch(&output, indices);
        if !batch.fallback_indices.is_empty() {
            warn!(indices = ?batch.fallback_indices, "pane_batch_fallback");
        }
        Ok(PollOutcome::Fresh(batch))
    }

    /// Captures a single pane such as `shogun:main`.
    pub async fn capture_pane(&self, query: &PaneQuery, target: &str) -> Result<String> {
        let command = panewatch_core::panes::capture_command(
            &query.tmux_bin,
            target,
            query.capture_lines,
        );
        self.exec(&command).await
    }

    /// Types `text` into `target`, waits, presses Enter, then waits for the
    /// pane to settle.
    pub async fn send_to_pane(&self, query: &PaneQuery, target: &str, text: &str) -> Result<()> {
        self.exec(&send_text_command(&query.tmux_bin, target, text))
            .await?;
        tokio::time::sleep(self.inner.config.enter_delay).await;
        self.exec(&send_enter_command(&query.tmux_bin, target))
            .await?;
        tokio::time::sleep(self.inner.config.settle_delay).await;
        Ok(())
    }

    pub async fn read_remote_file(&self, path: &str) -> Result<String> {
        self.exec(&format!("cat {}", shell_quote(path))).await
    }

    pub async fn run_usage_report(&self, script_path: &str) -> Result<UsageReport> {
        let output = self
            .exec(&format!("bash {}", shell_quote(script_path)))
            .await?;
        Ok(parse_usage_report(&output))
    }

    /// Runs the reconnect supervisor with the stored credentials.
    ///
    /// Returns `Ok` straight away when a reconnect is already running.
    pub async fn reconnect(&self) -> Result<()> {
        self.inner.reconnect().await
    }
}

impl State {
    fn is_live(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|transport| transport.is_alive())
            && self.shell.as_ref().is_some_and(|shell| !shell.is_finished())
    }
}

impl Inner {
    async fn establish(&self, credentials: &Credentials) -> Result<Arc<dyn Transport>> {
        let limit = self.config.connect_timeout;
        match tokio::time::timeout(limit, self.connector.connect(credentials, &self.config)).await
        {
            Ok(Ok(transport)) => Ok(transport),
            Ok(Err(err)) => {
                warn!("ssh_connect_error: {err}");
                Err(err)
            }
            Err(_) => {
                let err = SessionError::Connect {
                    host: credentials.host.clone(),
                    port: credentials.port,
                    password_len: credentials.password_len(),
                    cause: format!("timed out after {limit:?}"),
                };
                warn!("ssh_connect_error: {err}");
                Err(err)
            }
        }
    }

    async fn open_shell(&self, transport: &Arc<dyn Transport>) -> Result<ShellHandle> {
        let stream = transport.open_shell().await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, "shell_reader_started");
        Ok(ShellHandle::spawn(
            stream,
            generation,
            self.events.clone(),
            self.loss_tx.clone(),
        ))
    }

    async fn live_transport(&self) -> Result<Arc<dyn Transport>> {
        let state = self.state.lock().await;
        match &state.transport {
            Some(transport) if transport.is_alive() => Ok(transport.clone()),
            _ => Err(SessionError::NotConnected),
        }
    }

    async fn reconnect(self: &Arc<Self>) -> Result<()> {
        let Some(_running) = FlagGuard::acquire(&self.reconnecting) else {
            debug!("reconnect_already_running");
            return Ok(());
        };

        let (link, seen) = {
            let state = self.state.lock().await;
            if state.credentials.is_none() {
                return Err(SessionError::NotConnected);
            }
            (state.link.clone(), self.generation.load(Ordering::SeqCst))
        };

        let supervisor = ReconnectSupervisor::new(self.config.reconnect);
        supervisor
            .run(&self.events, &link, |_| {
                let inner = self.clone();
                let link = link.clone();
                async move { inner.reconnect_attempt(&link, seen).await }
            })
            .await
    }

    /// One attempt: drop the stale reader, then reuse a live transport or
    /// replace a dead one, then open a fresh shell.
    ///
    /// `seen` is the shell generation when the supervisor started; a live
    /// shell with a newer generation was installed by `connect` and is kept.
    async fn reconnect_attempt(&self, link: &CancellationToken, seen: u64) -> Result<()> {
        let _rebuild = self.rebuild.lock().await;
        let (credentials, shell, transport) = {
            let mut state = self.state.lock().await;
            let credentials = state.credentials.clone().ok_or(SessionError::NotConnected)?;
            if state.is_live() && self.generation.load(Ordering::SeqCst) != seen {
                debug!("reconnect_superseded_by_connect");
                return Ok(());
            }
            (credentials, state.shell.take(), state.transport.take())
        };
        if let Some(shell) = shell {
            shell.shutdown().await;
        }

        let transport = match transport {
            Some(transport) if transport.is_alive() => {
                debug!("reconnect_reusing_transport");
                transport
            }
            stale => {
                if let Some(dead) = stale {
                    dead.close().await;
                }
                self.establish(&credentials).await?
            }
        };

        // Only `disconnect` can touch the slots while `rebuild` is held, and it
        // only empties them.
        let shell = match self.open_shell(&transport).await {
            Ok(shell) => shell,
            Err(err) => {
                let mut state = self.state.lock().await;
                if link.is_cancelled() {
                    drop(state);
                    transport.close().await;
                    return Err(SessionError::NotConnected);
                }
                state.transport = Some(transport);
                return Err(err);
            }
        };

        let mut state = self.state.lock().await;
        if link.is_cancelled() {
            drop(state);
            shell.shutdown().await;
            transport.close().await;
            return Err(SessionError::NotConnected);
        }
        state.transport = Some(transport);
        state.shell = Some(shell);
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Consumes loss signals from shell readers and runs the reconnect
/// supervisor for the current generation.
fn spawn_watcher(inner: &Arc<Inner>, mut loss_rx: mpsc::UnboundedReceiver<u64>) {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let shutdown = inner.shutdown.clone();
    tokio::spawn(async move {
        loop {
            let generation = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = loss_rx.recv() => match received {
                    Some(generation) => generation,
                    None => break,
                },
            };
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let current = inner.generation.load(Ordering::SeqCst);
            if generation != current {
                debug!(generation, current, "stale_disconnect_ignored");
                continue;
            }
            if let Err(err) = inner.reconnect().await {
                warn!("reconnect_failed: {err}");
            }
        }
        debug!("session_watcher_stopped");
    });
}
