use apphub::{Config, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::resolve(std::env::args().skip(1));

    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(config.log_level.clone())).init();

    let server = Server::new(&config).await.expect("failed to build hub");
    let bound = server.start().await.expect("failed to start hub");
    info!(address = %bound, data_path = %config.data_path.display(), "apphub ready");

    shutdown_signal().await;

    server.shutdown().await;
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
