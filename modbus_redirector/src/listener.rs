//! The front-facing listener. Binds the listen endpoint and hands out client connections until it
//! is closed.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::ListenEndpoint;
use crate::connection::{ClientConnection, Connection, Role};
use crate::error::{ListenerError, StartupError};

pub struct Listener {
    server: TcpListener,
    local_addr: SocketAddr,
    closed: CancellationToken,
}

impl Listener {
    /// Binds the endpoint. Failure is a startup error and is never retried: a port in use or a
    /// missing bind privilege will not fix itself.
    pub async fn bind(endpoint: &ListenEndpoint) -> Result<Listener, StartupError> {
        let addr = endpoint.to_string();
        let server = TcpListener::bind(&addr)
            .await
            .map_err(|source| StartupError::Bind { addr: addr.clone(), source })?;
        let local_addr = server
            .local_addr()
            .map_err(|source| StartupError::Bind { addr, source })?;

        tracing::info!(%local_addr, "listening for MODBUS/TCP clients");

        Ok(Listener {
            server,
            local_addr,
            closed: CancellationToken::new(),
        })
    }

    /// The address actually bound, which differs from the endpoint when port 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the next client. Returns [`ListenerError::Closed`] once [`close`](Self::close)
    /// has been called, including for an accept that was already pending.
    pub async fn accept(&self) -> Result<ClientConnection, ListenerError> {
        if self.closed.is_cancelled() {
            return Err(ListenerError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ListenerError::Closed),
            res = self.server.accept() => {
                let (stream, peer) = res.map_err(ListenerError::Accept)?;
                Ok(Connection::new(Role::Client, stream, peer))
            }
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn accepts_client_with_role() {
        let listener = Listener::bind(&ListenEndpoint::new("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr();
        assert_ne!(addr.port(), 0);

        let client = TcpStream::connect(addr).await.unwrap();
        let conn = listener.accept().await.unwrap();
        assert_eq!(conn.role(), Role::Client);
        assert_eq!(conn.peer_addr(), client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn close_unblocks_pending_accept() {
        let listener = Arc::new(Listener::bind(&ListenEndpoint::new("127.0.0.1", 0)).await.unwrap());
        let pending = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        listener.close();

        let res = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("accept should return after close")
            .unwrap();
        assert!(matches!(res, Err(ListenerError::Closed)));
        assert!(matches!(listener.accept().await, Err(ListenerError::Closed)));
    }

    #[tokio::test]
    async fn bind_conflict_is_startup_error() {
        let first = Listener::bind(&ListenEndpoint::new("127.0.0.1", 0)).await.unwrap();
        let taken = ListenEndpoint::new("127.0.0.1", first.local_addr().port());

        let err = Listener::bind(&taken).await.err().expect("second bind must fail");
        assert!(matches!(err, StartupError::Bind { .. }));
    }
}
