//! This module contains the Connection structure used for both sides of a session: the client that
//! connected to the front port and the socket dialed to the backend.

use std::fmt;
use std::net::SocketAddr;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Which side of a session a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Accepted on the listen endpoint.
    Client,
    /// Dialed to the backend endpoint.
    Backend,
}

impl Role {
    /// The role on the other end of the pipe.
    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Backend,
            Role::Backend => Role::Client,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Backend => f.write_str("backend"),
        }
    }
}

/// A TCP socket tagged with its role in a session.
///
/// ```rust,ignore
/// let (stream, peer) = listener.accept().await?;
/// let client = Connection::new(Role::Client, stream, peer);
/// ```
#[derive(Debug)]
pub struct Connection {
    role: Role,
    peer: SocketAddr,
    stream: TcpStream,
}

/// A connection accepted on the front port.
pub type ClientConnection = Connection;

/// A connection dialed to the backend.
pub type BackendConnection = Connection;

impl Connection {
    /// Wraps a connected stream. Nagle is disabled since MODBUS frames are small request/response
    /// pairs; failing to set it is not worth dropping the connection over.
    pub fn new(role: Role, stream: TcpStream, peer: SocketAddr) -> Connection {
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(%role, %peer, error = %err, "unable to set TCP_NODELAY");
        }
        Connection { role, peer, stream }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Splits into owned halves so each relay direction can own the half it uses.
    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}
