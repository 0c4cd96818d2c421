//! One client, one backend: the lifecycle of a redirected connection.
//!
//! `Accepted → Dialing → Relaying → Closing → Closed`. A session that fails at any point goes
//! through `Closing` to `Closed` and is discarded; there are no retries, the client reconnects.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::connection::ClientConnection;
use crate::dialer::Dialer;
use crate::error::SessionError;
use crate::events::{EventBus, RedirectorEvent, RedirectorStats};
use crate::pipe::{self, PipeOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Client socket open, no backend yet.
    Accepted,
    Dialing,
    /// Both directions active.
    Relaying,
    /// At least one side has stopped or failed; the rest is being torn down.
    Closing,
    /// Both sockets released.
    Closed,
}

/// Shared by every session the redirector spawns.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub dialer: Dialer,
    pub pipe: PipeOptions,
    pub events: EventBus,
    pub stats: Arc<RedirectorStats>,
}

/// Summary returned once a session is closed.
#[derive(Debug)]
pub struct SessionOutcome {
    pub id: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub error: Option<SessionError>,
}

pub struct Session {
    id: u64,
    client_addr: SocketAddr,
    created: Instant,
    state: SessionState,
    events: EventBus,
}

impl Session {
    pub fn new(id: u64, client: &ClientConnection, events: EventBus) -> Session {
        Session {
            id,
            client_addr: client.peer_addr(),
            created: Instant::now(),
            state: SessionState::Accepted,
            events,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        tracing::trace!(session = self.id, from = ?self.state, to = ?next, "transition");
        self.state = next;
        self.events.emit(RedirectorEvent::SessionState { id: self.id, state: next });
    }

    /// Drives the session to `Closed`. `cancel` aborts the dial or the relay, whichever is running.
    pub async fn run(
        mut self,
        client: ClientConnection,
        ctx: &SessionContext,
        cancel: CancellationToken,
    ) -> SessionOutcome {
        ctx.stats.session_opened();
        self.events.emit(RedirectorEvent::SessionStarted {
            id: self.id,
            client: self.client_addr,
        });

        self.transition(SessionState::Dialing);
        let dialed = tokio::select! {
            _ = cancel.cancelled() => None,
            res = ctx.dialer.dial() => Some(res),
        };

        let (bytes_in, bytes_out, error) = match dialed {
            Some(Ok(backend)) => {
                tracing::debug!(
                    session = self.id,
                    client = %self.client_addr,
                    backend = %backend.peer_addr(),
                    "relaying"
                );
                self.transition(SessionState::Relaying);
                let report = pipe::relay(client, backend, ctx.pipe, cancel, &ctx.stats).await;
                self.transition(SessionState::Closing);
                (report.bytes_in(), report.bytes_out(), report.into_error())
            }
            Some(Err(err)) => {
                ctx.stats.dial_failed();
                self.events.emit(RedirectorEvent::DialFailed {
                    id: self.id,
                    backend: ctx.dialer.endpoint().to_string(),
                    reason: err.to_string(),
                });
                self.transition(SessionState::Closing);
                drop(client);
                (0, 0, Some(err))
            }
            None => {
                tracing::debug!(session = self.id, "shutdown while dialing");
                self.transition(SessionState::Closing);
                drop(client);
                (0, 0, None)
            }
        };

        self.transition(SessionState::Closed);
        ctx.stats.session_closed(error.is_some());
        self.events.emit(RedirectorEvent::SessionEnded {
            id: self.id,
            bytes_in,
            bytes_out,
            duration: self.created.elapsed(),
            error: error.as_ref().map(ToString::to_string),
        });

        SessionOutcome {
            id: self.id,
            bytes_in,
            bytes_out,
            error,
        }
    }
}
