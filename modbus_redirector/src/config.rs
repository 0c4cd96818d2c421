//! Endpoints and runtime configuration, plus the command line that produces them.
//!
//! Every flag falls back to an environment variable so the redirector can be configured
//! entirely from a service unit file.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use clap::{Arg, ArgMatches, Command};

use crate::error::StartupError;

/// Standard MODBUS/TCP port. Binding it usually needs elevated privileges.
pub const DEFAULT_LISTEN_PORT: u16 = 502;
/// Unprivileged port the real MODBUS server listens on.
pub const DEFAULT_BACKEND_PORT: u16 = 10502;
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
pub const DEFAULT_BACKEND_HOST: &str = "127.0.0.1";
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(5000);
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Address and port the redirector binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenEndpoint {
    pub host: String,
    pub port: u16,
}

/// Address and port of the real service. The host may be a DNS name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoint {
    pub host: String,
    pub port: u16,
}

impl ListenEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> ListenEndpoint {
        ListenEndpoint { host: host.into(), port }
    }
}

impl BackendEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> BackendEndpoint {
        BackendEndpoint { host: host.into(), port }
    }
}

impl Default for ListenEndpoint {
    fn default() -> Self {
        ListenEndpoint::new(DEFAULT_LISTEN_HOST, DEFAULT_LISTEN_PORT)
    }
}

impl Default for BackendEndpoint {
    fn default() -> Self {
        BackendEndpoint::new(DEFAULT_BACKEND_HOST, DEFAULT_BACKEND_PORT)
    }
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_host_port(f, &self.host, self.port)
    }
}

impl fmt::Display for BackendEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_host_port(f, &self.host, self.port)
    }
}

// IPv6 literals need brackets to be read back as host:port.
fn write_host_port(f: &mut fmt::Formatter<'_>, host: &str, port: u16) -> fmt::Result {
    if host.contains(':') && !host.starts_with('[') {
        write!(f, "[{}]:{}", host, port)
    } else {
        write!(f, "{}:{}", host, port)
    }
}

/// Log output format for the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Everything the redirector needs at startup. Immutable once built.
#[derive(Debug, Clone)]
pub struct RedirectorConfig {
    pub listen: ListenEndpoint,
    pub backend: BackendEndpoint,
    pub dial_timeout: Duration,
    /// How long shutdown waits for live sessions before giving up on them.
    pub grace_period: Duration,
    /// `None` relays without an idle limit.
    pub idle_timeout: Option<Duration>,
    pub buffer_size: usize,
    pub log_format: LogFormat,
}

impl Default for RedirectorConfig {
    fn default() -> Self {
        RedirectorConfig {
            listen: ListenEndpoint::default(),
            backend: BackendEndpoint::default(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            idle_timeout: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            log_format: LogFormat::Text,
        }
    }
}

impl RedirectorConfig {
    /// Creates a config for the given endpoints with default timeouts.
    pub fn new(listen: ListenEndpoint, backend: BackendEndpoint) -> RedirectorConfig {
        RedirectorConfig {
            listen,
            backend,
            ..RedirectorConfig::default()
        }
    }

    /// Rejects settings that could never produce a working redirector.
    pub fn validate(&self) -> Result<(), StartupError> {
        if self.backend.port == 0 {
            return Err(StartupError::Config("backend port must be non-zero".into()));
        }
        if self.backend.host.is_empty() {
            return Err(StartupError::Config("backend host must not be empty".into()));
        }
        if self.dial_timeout.is_zero() {
            return Err(StartupError::Config("dial timeout must be non-zero".into()));
        }
        if self.buffer_size == 0 {
            return Err(StartupError::Config("buffer size must be non-zero".into()));
        }
        if loops_back(&self.listen, &self.backend) {
            return Err(StartupError::Config(format!(
                "listen endpoint {} is the backend endpoint; connections would loop",
                self.listen
            )));
        }
        Ok(())
    }

    /// Builds and validates a config from parsed command line arguments.
    pub fn from_matches(matches: &ArgMatches) -> Result<RedirectorConfig, StartupError> {
        let listen = ListenEndpoint::new(
            string_arg(matches, "listen_host")?,
            parse_arg::<u16>(matches, "listen_port")?,
        );
        let backend = BackendEndpoint::new(
            string_arg(matches, "backend_host")?,
            parse_arg::<u16>(matches, "backend_port")?,
        );

        let idle_ms = parse_arg::<u64>(matches, "idle_timeout_ms")?;
        let log_format = match string_arg(matches, "log_format")?.to_ascii_lowercase().as_str() {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => {
                return Err(StartupError::Config(format!(
                    "invalid log format '{}', expected 'text' or 'json'",
                    other
                )))
            }
        };

        let config = RedirectorConfig {
            listen,
            backend,
            dial_timeout: Duration::from_millis(parse_arg(matches, "dial_timeout_ms")?),
            grace_period: Duration::from_millis(parse_arg(matches, "grace_period_ms")?),
            idle_timeout: (idle_ms > 0).then(|| Duration::from_millis(idle_ms)),
            buffer_size: parse_arg(matches, "buffer_size")?,
            log_format,
        };
        config.validate()?;
        Ok(config)
    }
}

/// True when the backend endpoint is one the listener itself accepts on.
fn loops_back(listen: &ListenEndpoint, backend: &BackendEndpoint) -> bool {
    if listen.port != backend.port {
        return false;
    }
    if listen.host.eq_ignore_ascii_case(&backend.host) {
        return true;
    }

    let backend_is_localhost = backend.host.eq_ignore_ascii_case("localhost");
    let backend_ip = parse_ip(&backend.host);
    match parse_ip(&listen.host) {
        // A wildcard listener also owns every loopback address on its port.
        Some(ip) if ip.is_unspecified() => {
            backend_is_localhost || backend_ip.is_some_and(|b| b.is_loopback() || b.is_unspecified())
        }
        Some(ip) if ip.is_loopback() => backend_is_localhost || backend_ip == Some(ip),
        Some(ip) => backend_ip == Some(ip),
        None => false,
    }
}

fn parse_ip(host: &str) -> Option<IpAddr> {
    host.trim_start_matches('[').trim_end_matches(']').parse().ok()
}

fn string_arg(matches: &ArgMatches, id: &str) -> Result<String, StartupError> {
    matches
        .get_one::<String>(id)
        .cloned()
        .ok_or_else(|| StartupError::Config(format!("missing parameter {}", id)))
}

fn parse_arg<T>(matches: &ArgMatches, id: &str) -> Result<T, StartupError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    let raw = string_arg(matches, id)?;
    raw.trim()
        .parse::<T>()
        .map_err(|err| StartupError::Config(format!("invalid value '{}' for {}: {}", raw, id, err)))
}

/// The command line definition for the `modbus_redirector` binary.
pub fn command() -> Command {
    Command::new("modbus_redirector")
        .about(
"This application accepts MODBUS/TCP clients on a front port and relays every connection, byte for byte, to a backend server.
\tUsage:
\t\tmodbus_redirector --listen-port 502 --backend-host 127.0.0.1 --backend-port 10502\n
 The above command accepts clients on port 502 and serves each one from a MODBUS server listening on localhost 10502.
 Binding port 502 normally requires elevated privileges (or CAP_NET_BIND_SERVICE); the backend does not.\n
 Every option can also be given through the environment variable shown next to it.\n")
        .arg(Arg::new("listen_host")
                    .long("listen-host")
                    .value_name("HOST")
                    .env("LISTEN_HOST")
                    .default_value(DEFAULT_LISTEN_HOST)
                    .help("Address to accept clients on"))
        .arg(Arg::new("listen_port")
                    .short('l')
                    .long("listen-port")
                    .value_name("PORT")
                    .env("LISTEN_PORT")
                    .default_value("502")
                    .help("Port to accept clients on (502 needs elevated bind privilege)"))
        .arg(Arg::new("backend_host")
                    .short('b')
                    .long("backend-host")
                    .value_name("HOST")
                    .env("BACKEND_HOST")
                    .default_value(DEFAULT_BACKEND_HOST)
                    .help("Host of the real MODBUS server"))
        .arg(Arg::new("backend_port")
                    .short('p')
                    .long("backend-port")
                    .value_name("PORT")
                    .env("BACKEND_PORT")
                    .default_value("10502")
                    .help("Port of the real MODBUS server"))
        .arg(Arg::new("dial_timeout_ms")
                    .long("dial-timeout-ms")
                    .value_name("MILLIS")
                    .env("DIAL_TIMEOUT_MS")
                    .default_value("5000")
                    .help("How long to wait for the backend to accept a connection"))
        .arg(Arg::new("grace_period_ms")
                    .long("grace-period-ms")
                    .value_name("MILLIS")
                    .env("SHUTDOWN_GRACE_MS")
                    .default_value("5000")
                    .help("How long shutdown waits for open sessions to close"))
        .arg(Arg::new("idle_timeout_ms")
                    .long("idle-timeout-ms")
                    .value_name("MILLIS")
                    .env("IDLE_TIMEOUT_MS")
                    .default_value("0")
                    .help("Close sessions with no traffic for this long (0 disables)"))
        .arg(Arg::new("buffer_size")
                    .long("buffer-size")
                    .value_name("BYTES")
                    .env("BUFFER_SIZE")
                    .default_value("8192")
                    .help("Relay buffer size per direction"))
        .arg(Arg::new("log_format")
                    .long("log-format")
                    .value_name("FORMAT")
                    .env("LOG_FORMAT")
                    .default_value("text")
                    .help("Log output format: 'text' or 'json'"))
}
