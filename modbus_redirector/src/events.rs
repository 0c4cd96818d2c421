//! Observability hook.
//!
//! Events are published on a broadcast channel so any number of external collaborators (a metrics
//! exporter, a supervisor, a test) can subscribe. Every event is also written to the log.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::session::SessionState;

/// Events published by the redirector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectorEvent {
    SessionStarted {
        id: u64,
        client: SocketAddr,
    },
    SessionState {
        id: u64,
        state: SessionState,
    },
    /// Published once the session reaches `Closed`.
    SessionEnded {
        id: u64,
        /// Client to backend.
        bytes_in: u64,
        /// Backend to client.
        bytes_out: u64,
        duration: Duration,
        /// Why the session ended, if it was not a clean close.
        error: Option<String>,
    },
    BindFailed {
        addr: String,
        reason: String,
    },
    DialFailed {
        id: u64,
        backend: String,
        reason: String,
    },
}

/// Cloneable sending side of the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RedirectorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> EventBus {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RedirectorEvent> {
        self.tx.subscribe()
    }

    /// Logs the event and hands it to subscribers. Never blocks; having no subscribers is fine.
    pub fn emit(&self, event: RedirectorEvent) {
        match &event {
            RedirectorEvent::SessionStarted { id, client } => {
                tracing::info!(event = "session_started", session = id, %client, "session started");
            }
            RedirectorEvent::SessionState { id, state } => {
                tracing::debug!(event = "session_state", session = id, ?state, "session state changed");
            }
            RedirectorEvent::SessionEnded { id, bytes_in, bytes_out, duration, error } => match error {
                Some(error) => tracing::warn!(
                    event = "session_ended",
                    session = id,
                    bytes_in,
                    bytes_out,
                    duration_ms = duration.as_millis() as u64,
                    %error,
                    "session ended with error"
                ),
                None => tracing::info!(
                    event = "session_ended",
                    session = id,
                    bytes_in,
                    bytes_out,
                    duration_ms = duration.as_millis() as u64,
                    "session ended"
                ),
            },
            RedirectorEvent::BindFailed { addr, reason } => {
                tracing::error!(event = "bind_failed", %addr, %reason, "unable to bind listener");
            }
            RedirectorEvent::DialFailed { id, backend, reason } => {
                tracing::warn!(event = "dial_failed", session = id, %backend, %reason, "unable to reach backend");
            }
        }

        match self.tx.send(event) {
            Ok(_) => (),
            Err(_) => (),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(1024)
    }
}

/// Process-wide counters, shared by every session.
#[derive(Debug, Default)]
pub struct RedirectorStats {
    sessions_accepted: AtomicU64,
    sessions_active: AtomicU64,
    sessions_completed: AtomicU64,
    session_errors: AtomicU64,
    dial_failures: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

/// Point-in-time copy of [`RedirectorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sessions_accepted: u64,
    pub sessions_active: u64,
    pub sessions_completed: u64,
    pub session_errors: u64,
    pub dial_failures: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl RedirectorStats {
    pub(crate) fn session_opened(&self) {
        self.sessions_accepted.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_closed(&self, failed: bool) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.session_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn dial_failed(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_accepted: self.sessions_accepted.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            session_errors: self.session_errors.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.emit(RedirectorEvent::BindFailed {
            addr: "0.0.0.0:502".into(),
            reason: "permission denied".into(),
        });
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let client: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        bus.emit(RedirectorEvent::SessionStarted { id: 1, client });
        bus.emit(RedirectorEvent::SessionState { id: 1, state: SessionState::Dialing });

        assert_eq!(rx.recv().await.unwrap(), RedirectorEvent::SessionStarted { id: 1, client });
        assert_eq!(
            rx.recv().await.unwrap(),
            RedirectorEvent::SessionState { id: 1, state: SessionState::Dialing }
        );
    }

    #[test]
    fn stats_track_session_lifecycle() {
        let stats = RedirectorStats::default();
        stats.session_opened();
        stats.session_opened();
        stats.add_bytes_in(12);
        stats.add_bytes_out(9);
        stats.session_closed(false);
        stats.dial_failed();
        stats.session_closed(true);

        let snap = stats.snapshot();
        assert_eq!(snap.sessions_accepted, 2);
        assert_eq!(snap.sessions_active, 0);
        assert_eq!(snap.sessions_completed, 2);
        assert_eq!(snap.session_errors, 1);
        assert_eq!(snap.dial_failures, 1);
        assert_eq!((snap.bytes_in, snap.bytes_out), (12, 9));
    }
}
