//! Opens the backend side of each session.

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time;

use crate::config::BackendEndpoint;
use crate::connection::{BackendConnection, Connection, Role};
use crate::error::SessionError;

/// Dials one fixed backend with a fixed timeout. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Dialer {
    endpoint: BackendEndpoint,
    timeout: Duration,
}

impl Dialer {
    pub fn new(endpoint: BackendEndpoint, timeout: Duration) -> Dialer {
        Dialer { endpoint, timeout }
    }

    pub fn endpoint(&self) -> &BackendEndpoint {
        &self.endpoint
    }

    pub async fn dial(&self) -> Result<BackendConnection, SessionError> {
        dial(&self.endpoint, self.timeout).await
    }
}

/// Connects to `endpoint`, giving up after `timeout`. The timeout covers name resolution too.
pub async fn dial(endpoint: &BackendEndpoint, timeout: Duration) -> Result<BackendConnection, SessionError> {
    let target = (endpoint.host.as_str(), endpoint.port);

    let stream = match time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(classify(endpoint, source)),
        Err(_) => {
            return Err(SessionError::DialTimeout {
                endpoint: endpoint.to_string(),
                timeout,
            })
        }
    };

    let peer = stream.peer_addr().map_err(|source| classify(endpoint, source))?;
    tracing::debug!(backend = %endpoint, %peer, "connected to backend");
    Ok(Connection::new(Role::Backend, stream, peer))
}

fn classify(endpoint: &BackendEndpoint, source: io::Error) -> SessionError {
    let endpoint = endpoint.to_string();
    match source.kind() {
        io::ErrorKind::ConnectionRefused => SessionError::ConnectionRefused { endpoint, source },
        _ => SessionError::BackendUnreachable { endpoint, source },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::{TcpListener, TcpSocket};

    /// A listener with backlog 1 whose accept queue is already full, so further SYNs are dropped.
    async fn saturated_listener() -> (TcpListener, Vec<TcpStream>) {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut queued = Vec::new();
        for _ in 0..8 {
            match time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => queued.push(stream),
                _ => break,
            }
        }
        (listener, queued)
    }

    #[tokio::test]
    async fn dials_listening_backend() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = backend.local_addr().unwrap().port();

        let dialer = Dialer::new(BackendEndpoint::new("127.0.0.1", port), Duration::from_secs(1));
        let conn = dialer.dial().await.unwrap();
        assert_eq!(conn.role(), Role::Backend);
        assert_eq!(conn.peer_addr(), backend.local_addr().unwrap());
    }

    #[tokio::test]
    async fn closed_port_is_connection_refused() {
        // Grab a free port, then release it so nothing listens there.
        let port = {
            let scratch = TcpListener::bind("127.0.0.1:0").await.unwrap();
            scratch.local_addr().unwrap().port()
        };

        let err = dial(&BackendEndpoint::new("127.0.0.1", port), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ConnectionRefused { .. }), "got {:?}", err);
        assert!(err.is_dial_failure());
    }

    #[tokio::test]
    async fn unresolvable_host_is_unreachable() {
        let err = dial(&BackendEndpoint::new("backend.invalid", 10502), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_dial_failure(), "got {:?}", err);
    }

    #[tokio::test]
    async fn silent_backend_times_out() {
        let (listener, _queued) = saturated_listener().await;
        let port = listener.local_addr().unwrap().port();
        let timeout = Duration::from_millis(300);

        let started = Instant::now();
        let err = dial(&BackendEndpoint::new("127.0.0.1", port), timeout).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, SessionError::DialTimeout { timeout: t, .. } if t == timeout), "got {:?}", err);
        assert!(err.is_dial_failure());
        assert!(elapsed >= timeout, "gave up early after {:?}", elapsed);
        assert!(elapsed < timeout + Duration::from_millis(500), "took {:?}", elapsed);
    }
}
