//! This modbus_redirector is the console application that serves the MODBUS/TCP port from an unprivileged backend.
use modbus_redirector::config::{self, LogFormat, RedirectorConfig};
use modbus_redirector::{EventBus, Redirector, ShutdownError};

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// This program binds the front port (502 by default), and relays every client that connects to it to the
/// backend MODBUS server (localhost 10502 by default). No payload is inspected or modified.
///
/// To get a help message, run with the -h flag.
///
/// To exit the program, type Ctrl-C (or send SIGTERM). Open sessions are closed before exit.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    //Parse the input arguments.
    let matches = config::command().get_matches();
    let config = RedirectorConfig::from_matches(&matches);

    init_tracing(config.as_ref().map(|c| c.log_format).unwrap_or_default());
    let config = config.context("invalid configuration")?;

    let redirector = Redirector::bind(config, EventBus::default())
        .await
        .context("unable to start redirector")?;

    let shutdown = redirector.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });

    match redirector.run().await {
        Ok(_) => {}
        Err(ShutdownError::GracePeriodElapsed { remaining, grace }) => {
            // Exiting drops whatever is left.
            tracing::warn!(remaining, grace_ms = grace.as_millis() as u64, "abandoning open sessions");
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "modbus_redirector=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(err) => {
                tracing::error!(error = %err, "unable to listen for shutdown signal");
                // we also shut down in case of error
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
