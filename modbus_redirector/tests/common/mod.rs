//! Test doubles: a backend that records or echoes, and a redirector running on ephemeral ports.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use modbus_redirector::{
    BackendEndpoint, EventBus, ListenEndpoint, Redirector, RedirectorConfig, RedirectorEvent,
    RedirectorStats, ShutdownError, StatsSnapshot,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct RunningRedirector {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub events: broadcast::Receiver<RedirectorEvent>,
    pub stats: Arc<RedirectorStats>,
    pub handle: JoinHandle<Result<StatsSnapshot, ShutdownError>>,
}

pub fn config_for(backend_port: u16) -> RedirectorConfig {
    let mut config = RedirectorConfig::new(
        ListenEndpoint::new("127.0.0.1", 0),
        BackendEndpoint::new("127.0.0.1", backend_port),
    );
    config.dial_timeout = Duration::from_millis(500);
    config.grace_period = Duration::from_secs(2);
    config
}

pub async fn start(config: RedirectorConfig) -> RunningRedirector {
    let bus = EventBus::new(4096);
    let events = bus.subscribe();
    let redirector = Redirector::bind(config, bus).await.expect("redirector should bind");

    RunningRedirector {
        addr: redirector.local_addr(),
        shutdown: redirector.shutdown_token(),
        events,
        stats: redirector.stats(),
        handle: tokio::spawn(redirector.run()),
    }
}

/// Binds a backend on an ephemeral port without accepting yet.
pub async fn backend_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// A port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let scratch = TcpListener::bind("127.0.0.1:0").await.unwrap();
    scratch.local_addr().unwrap().port()
}

/// A backend with backlog 1 whose accept queue is already full: dials to it hang until they time out.
/// Keep the returned streams alive for as long as the backend must stay saturated.
pub async fn saturated_backend() -> (TcpListener, Vec<TcpStream>, u16) {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(1).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut queued = Vec::new();
    for _ in 0..8 {
        match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => queued.push(stream),
            _ => break,
        }
    }
    (listener, queued, addr.port())
}

/// Echoes every connection back to itself until the peer closes.
pub async fn spawn_echo_backend() -> u16 {
    let (listener, port) = backend_listener().await;
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.into_split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
                let _ = wr.shutdown().await;
            });
        }
    });
    port
}

pub async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.expect("redirector should accept")
}

/// Waits for the next event matching `pred`, skipping everything else.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<RedirectorEvent>, mut pred: F) -> RedirectorEvent
where
    F: FnMut(&RedirectorEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => panic!("event bus closed: {}", err),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
