//! The redirector: accepts clients on the front port and spawns a session for each one.
//!
//! ```rust,ignore
//! let redirector = Redirector::bind(config, EventBus::default()).await?;
//! let shutdown = redirector.shutdown_token();
//! tokio::spawn(async move { signal::ctrl_c().await.ok(); shutdown.cancel(); });
//! redirector.run().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::RedirectorConfig;
use crate::dialer::Dialer;
use crate::error::{ListenerError, ShutdownError, StartupError};
use crate::events::{EventBus, RedirectorEvent, RedirectorStats, StatsSnapshot};
use crate::listener::Listener;
use crate::pipe::PipeOptions;
use crate::session::{Session, SessionContext};

/// Pause after a failed accept so descriptor exhaustion does not turn into a busy loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Redirector {
    config: RedirectorConfig,
    listener: Listener,
    ctx: SessionContext,
    shutdown: CancellationToken,
    sessions: TaskTracker,
}

impl Redirector {
    /// Validates the config and binds the listen endpoint. A bind failure is published as a
    /// `BindFailed` event before it is returned.
    pub async fn bind(config: RedirectorConfig, events: EventBus) -> Result<Redirector, StartupError> {
        config.validate()?;

        let listener = match Listener::bind(&config.listen).await {
            Ok(listener) => listener,
            Err(err) => {
                events.emit(RedirectorEvent::BindFailed {
                    addr: config.listen.to_string(),
                    reason: err.to_string(),
                });
                return Err(err);
            }
        };

        let ctx = SessionContext {
            dialer: Dialer::new(config.backend.clone(), config.dial_timeout),
            pipe: PipeOptions {
                buffer_size: config.buffer_size,
                idle_timeout: config.idle_timeout,
            },
            events,
            stats: Arc::new(RedirectorStats::default()),
        };

        tracing::info!(
            listen = %listener.local_addr(),
            backend = %config.backend,
            dial_timeout_ms = config.dial_timeout.as_millis() as u64,
            "redirector ready"
        );

        Ok(Redirector {
            config,
            listener,
            ctx,
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Cancelling this token stops accepting and closes every live session.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> Arc<RedirectorStats> {
        self.ctx.stats.clone()
    }

    /// Accepts clients until the shutdown token is cancelled, then closes the listener and waits
    /// up to the grace period for sessions to finish.
    pub async fn run(self) -> Result<StatsSnapshot, ShutdownError> {
        let mut next_id: u64 = 0;

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                res = self.listener.accept() => res,
            };

            let client = match accepted {
                Ok(client) => client,
                Err(ListenerError::Closed) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed, retrying");
                    time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            next_id += 1;
            let session = Session::new(next_id, &client, self.ctx.events.clone());
            let ctx = self.ctx.clone();
            let cancel = self.shutdown.child_token();
            self.sessions.spawn(async move {
                let outcome = session.run(client, &ctx, cancel).await;
                tracing::trace!(
                    session = outcome.id,
                    bytes_in = outcome.bytes_in,
                    bytes_out = outcome.bytes_out,
                    failed = outcome.error.is_some(),
                    "session task finished"
                );
            });
        }

        self.drain().await
    }

    async fn drain(self) -> Result<StatsSnapshot, ShutdownError> {
        self.listener.close();
        // Sessions watch child tokens, so this also covers a listener that closed on its own.
        self.shutdown.cancel();
        self.sessions.close();

        let grace = self.config.grace_period;
        tracing::info!(live = self.sessions.len(), grace_ms = grace.as_millis() as u64, "shutting down");

        if time::timeout(grace, self.sessions.wait()).await.is_err() {
            let remaining = self.sessions.len();
            tracing::warn!(remaining, "sessions still open after grace period");
            return Err(ShutdownError::GracePeriodElapsed { remaining, grace });
        }

        let snapshot = self.ctx.stats.snapshot();
        tracing::info!(
            sessions = snapshot.sessions_completed,
            bytes_in = snapshot.bytes_in,
            bytes_out = snapshot.bytes_out,
            "redirector stopped"
        );
        Ok(snapshot)
    }
}
