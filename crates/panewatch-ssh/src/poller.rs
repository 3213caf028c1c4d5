use crate::error::Result;
use crate::events::PollOutcome;
use crate::session::RemoteSession;
use panewatch_core::{PaneBatch, PaneQuery};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Periodically refreshes a fixed set of panes and publishes each generation.
pub struct PanePoller {
    session: RemoteSession,
    query: PaneQuery,
    paused: Arc<AtomicBool>,
    refresh: Arc<Notify>,
    cancel: CancellationToken,
    latest: watch::Receiver<Option<PaneBatch>>,
    task: JoinHandle<()>,
}

impl PanePoller {
    pub fn spawn(
        session: RemoteSession,
        query: PaneQuery,
        indices: Vec<usize>,
        interval: Duration,
    ) -> Self {
        let (tx, latest) = watch::channel(None);
        let paused = Arc::new(AtomicBool::new(false));
        let refresh = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(poll_loop(
            session.clone(),
            query.clone(),
            indices,
            interval,
            tx,
            paused.clone(),
            refresh.clone(),
            cancel.clone(),
        ));

        Self {
            session,
            query,
            paused,
            refresh,
            cancel,
            latest,
            task,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PaneBatch>> {
        self.latest.clone()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resumes ticking and refreshes right away.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.refresh.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn refresh_now(&self) {
        self.refresh.notify_one();
    }

    /// Paced input to pane `index`, followed by an immediate refresh.
    pub async fn send_to_pane(&self, index: usize, text: &str) -> Result<()> {
        let target = self.query.target(index);
        self.session.send_to_pane(&self.query, &target, text).await?;
        self.refresh_now();
        Ok(())
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            debug!("pane_poller_join_error: {err}");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_loop(
    session: RemoteSession,
    query: PaneQuery,
    indices: Vec<usize>,
    interval: Duration,
    tx: watch::Sender<Option<PaneBatch>>,
    paused: Arc<AtomicBool>,
    refresh: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = refresh.notified() => {}
        }
        if paused.load(Ordering::SeqCst) {
            continue;
        }
        if !session.is_connected().await {
            debug!("pane_poll_skipped_disconnected");
            continue;
        }
        match session.poll_panes_batch(&query, &indices).await {
            Ok(PollOutcome::Fresh(batch)) => {
                let _ = tx.send(Some(batch));
            }
            Ok(PollOutcome::Skipped) => {}
            Err(err) => warn!("pane_poll_error: {err}"),
        }
    }
    debug!("pane_poller_stopped");
}
