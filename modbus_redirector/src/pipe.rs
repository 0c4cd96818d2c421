//! Bidirectional relay between a client and its backend.
//!
//! ```text
//! client rd ─────► buffer ─────► backend wr      (bytes_in)
//! client wr ◄───── buffer ◄───── backend rd      (bytes_out)
//! ```
//!
//! Each direction copies until its source reaches end-of-stream, then half-closes its destination
//! and stops. The pipe finishes once both directions have stopped. A read or write error in one
//! direction cancels the other, and every read and write races the cancellation token so a
//! direction stuck on a slow peer cannot hold up teardown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_BUFFER_SIZE;
use crate::connection::{BackendConnection, ClientConnection, Role};
use crate::error::SessionError;
use crate::events::RedirectorStats;

#[derive(Debug, Clone, Copy)]
pub struct PipeOptions {
    pub buffer_size: usize,
    /// Tear the session down when neither direction has moved a byte for this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for PipeOptions {
    fn default() -> Self {
        PipeOptions {
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: None,
        }
    }
}

/// How a direction stopped when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionEnd {
    /// The source closed and the destination was half-closed.
    Eof,
    /// The sibling direction failed or the session was shut down.
    Cancelled,
}

#[derive(Debug)]
pub struct DirectionReport {
    /// Bytes written to the destination, counted even when the direction later failed.
    pub bytes: u64,
    pub result: Result<DirectionEnd, SessionError>,
}

#[derive(Debug)]
pub struct PipeReport {
    pub client_to_backend: DirectionReport,
    pub backend_to_client: DirectionReport,
}

impl PipeReport {
    pub fn bytes_in(&self) -> u64 {
        self.client_to_backend.bytes
    }

    pub fn bytes_out(&self) -> u64 {
        self.backend_to_client.bytes
    }

    /// The error that ended the session, if any. The client side wins when both failed.
    pub fn into_error(self) -> Option<SessionError> {
        self.client_to_backend
            .result
            .err()
            .or_else(|| self.backend_to_client.result.err())
    }
}

/// Time of the last byte moved in either direction, as millis since the pipe started.
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Activity {
        Activity {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_ms
            .store(self.origin.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

/// Relays between `client` and `backend` until both directions stop or `cancel` fires.
/// Both sockets are closed when this returns.
pub async fn relay(
    client: ClientConnection,
    backend: BackendConnection,
    options: PipeOptions,
    cancel: CancellationToken,
    stats: &RedirectorStats,
) -> PipeReport {
    let (client_rd, client_wr) = client.into_split();
    let (backend_rd, backend_wr) = backend.into_split();
    let activity = Activity::new();

    let (client_to_backend, backend_to_client) = tokio::join!(
        forward(client_rd, backend_wr, Role::Client, &options, &cancel, &activity, stats),
        forward(backend_rd, client_wr, Role::Backend, &options, &cancel, &activity, stats),
    );

    PipeReport {
        client_to_backend,
        backend_to_client,
    }
}

async fn forward(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    from: Role,
    options: &PipeOptions,
    cancel: &CancellationToken,
    activity: &Activity,
    stats: &RedirectorStats,
) -> DirectionReport {
    let to = from.peer();
    let mut buf = BytesMut::with_capacity(options.buffer_size);
    let mut bytes: u64 = 0;

    loop {
        buf.clear();

        let read = tokio::select! {
            _ = cancel.cancelled() => {
                return DirectionReport { bytes, result: Ok(DirectionEnd::Cancelled) };
            }
            res = read_chunk(&mut reader, &mut buf, from, options.idle_timeout, activity) => res,
        };

        let n = match read {
            Ok(0) => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return DirectionReport { bytes, result: Ok(DirectionEnd::Cancelled) };
                    }
                    res = writer.shutdown() => {
                        // The destination may already be gone; its own direction reports that.
                        if let Err(err) = res {
                            tracing::debug!(%from, %to, error = %err, "half-close failed");
                        }
                    }
                }
                tracing::trace!(%from, %to, bytes, "end of stream, half-closed destination");
                return DirectionReport { bytes, result: Ok(DirectionEnd::Eof) };
            }
            Ok(n) => n,
            Err(err) => {
                cancel.cancel();
                return DirectionReport { bytes, result: Err(err) };
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                return DirectionReport { bytes, result: Ok(DirectionEnd::Cancelled) };
            }
            res = writer.write_all(&buf[..n]) => {
                if let Err(source) = res {
                    cancel.cancel();
                    return DirectionReport {
                        bytes,
                        result: Err(SessionError::WriteFailed { role: to, source }),
                    };
                }
            }
        }

        bytes += n as u64;
        activity.touch();
        match from {
            Role::Client => stats.add_bytes_in(n as u64),
            Role::Backend => stats.add_bytes_out(n as u64),
        }
    }
}

/// Reads the next chunk. With an idle timeout, a quiet direction keeps waiting as long as the other
/// direction is still moving bytes.
async fn read_chunk(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    from: Role,
    idle_timeout: Option<Duration>,
    activity: &Activity,
) -> Result<usize, SessionError> {
    let read_failed = |source| SessionError::ReadFailed { role: from, source };

    let Some(idle) = idle_timeout else {
        return reader.read_buf(buf).await.map_err(read_failed);
    };

    loop {
        let quiet = activity.idle_for();
        if quiet >= idle {
            return Err(SessionError::IdleTimeout(idle));
        }
        if let Ok(res) = time::timeout(idle - quiet, reader.read_buf(buf)).await {
            return res.map_err(read_failed);
        }
    }
}
