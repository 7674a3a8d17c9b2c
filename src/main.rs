mod cert;
mod config;
mod error;
mod proxy;
#[cfg(test)]
mod test_support;

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat};
use crate::proxy::dialer::BackendDialer;
use crate::proxy::tls_acceptor::{self, Relay};

#[tokio::main]
async fn main() {
    let config = match Config::from_args() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config.log_format);

    if let Err(e) = run(config).await {
        error!(error = %e, "ssl-terminator exited with error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> error::Result<()> {
    let server_config =
        cert::loader::load_server_config(&config.cert_path, &config.key_path)?;
    let client_config = cert::loader::load_client_config(config.backend_ca.as_deref())?;

    let dialer = BackendDialer::new(config.backend_addr.clone(), Arc::new(client_config))?;
    let relay = Relay::new(Arc::new(server_config), dialer);

    let listener = tls_acceptor::bind(&config.listen_addr).await?;
    info!(
        "local server on: {}, backend server on: {}",
        config.listen_addr,
        relay.backend_addr()
    );

    tokio::select! {
        result = relay.serve(listener) => result,
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping...");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!(error = %e, "failed to register SIGTERM handler");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = ctrl_c.await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}

fn init_logging(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}
