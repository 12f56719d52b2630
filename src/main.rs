//! ibgate server binary.
//!
//! REST gateway in front of Interactive Brokers TWS/Gateway: resolves bond
//! future product codes to contracts and serves historical bars over HTTP.

mod correlate;
mod error;
mod models;
mod products;
mod resolver;
mod session;
mod web;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use session::GatewayConfig;
use web::Gateway;

/// ibgate — HTTP gateway for IB market data and contract metadata.
#[derive(Parser, Debug)]
#[command(name = "ibgate", version)]
struct Args {
    /// IB TWS/Gateway host
    #[arg(long = "ib-host", env = "IB_HOST", default_value = "127.0.0.1")]
    ib_host: String,

    /// IB TWS/Gateway port
    #[arg(long = "ib-port", env = "IB_PORT", default_value_t = 4002)]
    ib_port: u16,

    /// IB client ID for the primary session
    #[arg(long = "ib-client-id", env = "IB_CLIENT_ID", default_value_t = 1)]
    ib_client_id: i32,

    /// Seconds to wait for the broker to become ready on connect
    #[arg(
        long = "connect-timeout",
        env = "IB_CONNECT_TIMEOUT_SECS",
        default_value_t = 10
    )]
    connect_timeout_secs: u64,

    /// HTTP listen port
    #[arg(long = "server-port", env = "IB_SERVER_PORT", default_value_t = 5000)]
    server_port: u16,
}

fn print_endpoints(port: u16) {
    println!();
    println!("ibgate is ready on port {port}:");
    println!("  Health:           GET  http://localhost:{port}/health");
    println!("  Reconnect:        POST http://localhost:{port}/reconnect");
    println!("  Products:         GET  http://localhost:{port}/products");
    println!("  Market data:      GET  http://localhost:{port}/market-data/EURBBL?duration=10%20M");
    println!("  Contract details: GET  http://localhost:{port}/contract-details/EURBBL");
    println!();
    println!("Press Ctrl+C to stop the server...");
    println!();
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = GatewayConfig {
        ib_host: args.ib_host,
        ib_port: args.ib_port,
        ib_client_id: args.ib_client_id,
        connect_timeout: Duration::from_secs(args.connect_timeout_secs),
    };

    println!(
        "Connecting to IB TWS/Gateway at {}:{} (client ID: {})...",
        config.ib_host, config.ib_port, config.ib_client_id
    );

    // A dead broker at startup is not fatal: the server comes up anyway and
    // POST /reconnect establishes the session once TWS is reachable.
    let initial_session = match session::Session::connect(&config).await {
        Ok(session) => {
            println!("Successfully connected to IB!");
            Some(session)
        }
        Err(e) => {
            tracing::warn!(error = %e, "initial TWS connect failed, starting disconnected");
            eprintln!("Could not connect to IB TWS/Gateway: {e}");
            eprintln!("Starting anyway; use POST /reconnect once TWS is reachable.");
            None
        }
    };

    let gateway = Arc::new(Gateway::new(config, initial_session));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let shutdown_tx = Arc::new(std::sync::Mutex::new(Some(shutdown_tx)));

    ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, shutting down gracefully...");
        if let Ok(mut guard) = shutdown_tx.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(());
            }
        }
    })
    .expect("Failed to set Ctrl+C handler");

    let app = web::router(gateway.clone());

    print_endpoints(args.server_port);

    let addr = format!("0.0.0.0:{}", args.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
        .expect("Server error");

    println!("Shutting down...");
    gateway.shutdown().await;
    println!("Shutdown complete. Goodbye!");
}
