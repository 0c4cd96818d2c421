//! This is the modbus_redirector crate. It accepts MODBUS/TCP clients on the privileged front port
//! (502) and relays each connection, byte for byte, to a MODBUS server listening on an unprivileged
//! backend port (10502), so the server itself never needs elevated privileges. Payloads are not
//! parsed or modified.


pub mod config;
pub mod connection;
pub mod dialer;
pub mod error;
pub mod events;
pub mod listener;
pub mod pipe;
pub mod redirector;
pub mod session;

pub use config::{BackendEndpoint, ListenEndpoint, LogFormat, RedirectorConfig};
pub use connection::{Connection, Role};
pub use error::{ListenerError, SessionError, ShutdownError, StartupError};
pub use events::{EventBus, RedirectorEvent, RedirectorStats, StatsSnapshot};
pub use redirector::Redirector;
pub use session::SessionState;
