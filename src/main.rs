//! Beehive Server
//!
//! Runs the binary TCP edge for native clients and the WebSocket gateway for
//! browsers side by side until Ctrl+C or SIGTERM.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use beehive_server::config::ServerConfig;
use beehive_server::gateway;
use beehive_server::net::TcpEdgeServer;
use beehive_server::state::AppState;
use beehive_server::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so the log format can come from it
    let config = ServerConfig::load().await?;
    init_logging(&config.log_format);

    info!(version = VERSION, name = %config.name, "Beehive server starting");
    info!(
        "Configuration loaded from: {}",
        config.config_path.display()
    );

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let state = Arc::new(AppState::new(config.clone(), shutdown_tx.clone())?);
    info!("Application state initialized");

    // TCP edge
    let tcp_addr = config.tcp_addr()?;
    let tcp_server = Arc::new(TcpEdgeServer::bind(tcp_addr, Arc::clone(&state.sessions)).await?);
    info!("TCP edge listening on: {}", tcp_addr);

    let serving = Arc::clone(&tcp_server);
    let im = Arc::clone(&state.backend.im);
    let settings = state.edge_settings();
    let tcp_handle = tokio::spawn(async move {
        if let Err(e) = serving.serve(im, settings).await {
            error!("TCP edge server error: {}", e);
        }
    });

    let mut tcp_shutdown_rx = shutdown_tx.subscribe();
    let closing = Arc::clone(&tcp_server);
    let tcp_close_handle = tokio::spawn(async move {
        let _ = tcp_shutdown_rx.recv().await;
        info!("TCP edge shutting down");
        closing.close().await;
    });

    // WebSocket gateway
    let ws_addr = config.websocket_addr()?;
    let ws_listener = TcpListener::bind(ws_addr).await?;
    info!("WebSocket gateway listening on: {}", ws_addr);

    let ws_state = Arc::clone(&state);
    let ws_shutdown_rx = shutdown_tx.subscribe();
    let ws_handle = tokio::spawn(async move {
        run_gateway(ws_listener, ws_state, ws_shutdown_rx).await;
    });

    info!("Server startup complete!");

    // Wait for shutdown signal
    wait_for_shutdown(shutdown_tx.clone()).await;

    info!("Shutting down server...");

    let _ = tcp_close_handle.await;
    let _ = tcp_handle.await;
    let _ = ws_handle.await;

    info!(
        tcp_sessions = state.sessions.session_count(),
        ws_connections = state.connections.count(),
        "Server shutdown complete. Goodbye!"
    );
    Ok(())
}

/// Initialize the logging/tracing system
fn init_logging(format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,beehive_server=debug"));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true);

    if format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Run the WebSocket gateway until shutdown
async fn run_gateway(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let router = gateway::create_router(Arc::clone(&state));

    let shutdown_signal = async move {
        let _ = shutdown_rx.recv().await;
        info!("WebSocket gateway shutting down");
        // Upgraded sockets are not tracked by graceful shutdown
        state.connections.close_all();
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .unwrap_or_else(|e| error!("WebSocket gateway error: {}", e));
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Signal all tasks to shut down
    let _ = shutdown_tx.send(());
}
