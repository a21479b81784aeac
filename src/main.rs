// =============================================================================
// Orbiton Matrix Homeserver Core - Server Binary
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Startup: configuration, logging, the events database, the service
//   container, the federation listener, and graceful shutdown.
//
// =============================================================================

use std::net::SocketAddr;

use orbiton::{clap, config::Config, database::KeyValueDatabase, init_services, services, Services};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

fn main() {
    let args = clap::parse();

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };
    config.warn_deprecated();

    let filter = EnvFilter::try_new(&config.log).unwrap_or_else(|e| {
        eprintln!("Log filter invalid ({e}); falling back to warn");
        EnvFilter::new("warn")
    });
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    info!("🌌 Orbiton {} starting", env!("CARGO_PKG_VERSION"));
    info!("{}", config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime builds");

    runtime.block_on(async {
        if let Err(e) = run(config).await {
            error!("Fatal: {}", e);
            std::process::exit(1);
        }
    });
}

async fn run(config: Config) -> orbiton::Result<()> {
    let address = SocketAddr::new(config.address, config.port);

    let db = KeyValueDatabase::load_or_create(&config)?;
    let services_container = Services::build(db, config)?;
    init_services(services_container)?;

    services().sending.start();
    services()
        .fetch
        .start_horizon_sweeper(std::time::Duration::from_secs(60));

    let app = orbiton::api::server_server::router().layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(address).await?;
    info!("🛰️ Federation listener on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| orbiton::Error::Internal(format!("listener failed: {e}")))?;

    services().globals.shutdown().await;
    db.sync()?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutting down");
}
