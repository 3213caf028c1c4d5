use crate::config::ReconnectPolicy;
use crate::error::{Result, SessionError};
use crate::events::SessionEvent;
use std::future::Future;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bounded retry loop around a single reconnect attempt.
///
/// The attempt itself (reopen the shell or rebuild the transport) is supplied
/// by the caller, so the loop only owns pacing, events and the stop rules.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectSupervisor {
    policy: ReconnectPolicy,
}

impl ReconnectSupervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy }
    }

    /// Runs up to `max_attempts` attempts, sleeping `delay` between them.
    ///
    /// Stops early on a fatal error or once `cancel` fires (the session was
    /// closed explicitly); both are returned as-is.
    pub async fn run<F, Fut>(
        &self,
        events: &broadcast::Sender<SessionEvent>,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<()>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = SessionError::NotConnected;

        for number in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(SessionError::NotConnected);
            }
            let _ = events.send(SessionEvent::Reconnecting {
                attempt: number,
                max_attempts,
            });
            info!(attempt = number, max_attempts, "reconnect_attempt");

            match attempt(number).await {
                Ok(()) => {
                    info!(attempt = number, "reconnect_succeeded");
                    let _ = events.send(SessionEvent::Reconnected);
                    return Ok(());
                }
                Err(err) if err.is_fatal() => {
                    warn!("reconnect_fatal: {err}");
                    let _ = events.send(SessionEvent::ReconnectFailed {
                        message: err.to_string(),
                    });
                    return Err(err);
                }
                Err(err) => {
                    warn!(attempt = number, "reconnect_error: {err}");
                    last_error = err;
                }
            }

            if number < max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SessionError::NotConnected),
                    _ = tokio::time::sleep(self.policy.delay) => {}
                }
            }
        }

        let exhausted = SessionError::ReconnectExhausted {
            attempts: max_attempts,
            last: last_error.to_string(),
        };
        let _ = events.send(SessionEvent::ReconnectFailed {
            message: exhausted.to_string(),
        });
        Err(exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (events, mut rx) = broadcast::channel(16);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = ReconnectSupervisor::new(fast_policy(3))
            .run(&events, &CancellationToken::new(), move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SessionError::Channel("unreachable".to_string()))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(SessionError::ReconnectExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.contains("unreachable"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen.iter()
                .filter(|event| matches!(event, SessionEvent::Reconnecting { .. }))
                .count(),
            3
        );
        assert!(matches!(
            seen.last(),
            Some(SessionEvent::ReconnectFailed { .. })
        ));
    }

    #[tokio::test]
    async fn succeeds_on_second_attempt() {
        let (events, mut rx) = broadcast::channel(16);
        let result = ReconnectSupervisor::new(fast_policy(3))
            .run(&events, &CancellationToken::new(), |number| async move {
                if number == 2 {
                    Ok(())
                } else {
                    Err(SessionError::StreamClosed)
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(
            rx.try_recv().expect("first event"),
            SessionEvent::Reconnecting {
                attempt: 1,
                max_attempts: 3
            }
        );
        assert_eq!(
            rx.try_recv().expect("second event"),
            SessionEvent::Reconnecting {
                attempt: 2,
                max_attempts: 3
            }
        );
        assert_eq!(rx.try_recv().expect("third event"), SessionEvent::Reconnected);
    }

    #[tokio::test]
    async fn fatal_error_stops_immediately() {
        let (events, _rx) = broadcast::channel(16);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = ReconnectSupervisor::new(fast_policy(3))
            .run(&events, &CancellationToken::new(), move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SessionError::AuthRejected {
                        user: "shogun".to_string(),
                        host: "example".to_string(),
                    })
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(SessionError::AuthRejected { .. })));
    }

    #[tokio::test]
    async fn cancelled_session_is_not_retried() {
        let (events, _rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = ReconnectSupervisor::new(fast_policy(3))
            .run(&events, &cancel, |_| async { Ok(()) })
            .await;

        assert_eq!(result, Err(SessionError::NotConnected));
    }
}
