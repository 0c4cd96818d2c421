//! Error types for the redirector.
//!
//! Errors are split by blast radius: a `StartupError` stops the process, a `SessionError`
//! only ever tears down the one session it happened in, and a `ShutdownError` is reported
//! once the grace period is over.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::connection::Role;

/// Fatal errors raised before the redirector starts accepting clients.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Errors returned by [`Listener::accept`](crate::listener::Listener::accept).
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener closed")]
    Closed,

    /// Usually descriptor exhaustion; the listener itself is still usable.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

/// Errors local to one session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("dial to backend {endpoint} timed out after {timeout:?}")]
    DialTimeout { endpoint: String, timeout: Duration },

    #[error("backend {endpoint} refused the connection")]
    ConnectionRefused {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("backend {endpoint} unreachable: {source}")]
    BackendUnreachable {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("read from {role} failed: {source}")]
    ReadFailed {
        role: Role,
        #[source]
        source: io::Error,
    },

    #[error("write to {role} failed: {source}")]
    WriteFailed {
        role: Role,
        #[source]
        source: io::Error,
    },

    #[error("session idle for {0:?}")]
    IdleTimeout(Duration),
}

impl SessionError {
    /// True for the errors raised while dialing the backend.
    pub fn is_dial_failure(&self) -> bool {
        matches!(
            self,
            SessionError::DialTimeout { .. }
                | SessionError::ConnectionRefused { .. }
                | SessionError::BackendUnreachable { .. }
        )
    }
}

/// Raised when live sessions outlast the shutdown grace period.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("{remaining} session(s) still open after the {grace:?} grace period")]
    GracePeriodElapsed { remaining: usize, grace: Duration },
}

