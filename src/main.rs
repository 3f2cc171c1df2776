//! netcache-ctl: backend server and switch controller for an in-network
//! key-value cache.
//!
//! Runs the backend (UDP reads, TCP writes/deletes, coherency handshake),
//! the controller's report loop, the periodic measurement reset and the
//! admin HTTP API in one process. The switch is driven through the in-memory
//! control port model.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{error, info};

use netcache_ctl::cache::directory::new_shared_directory;
use netcache_ctl::config::{Cli, Config};
use netcache_ctl::controller::dispatcher::ReportDispatcher;
use netcache_ctl::controller::reports::serve_reports;
use netcache_ctl::controller::{configure_switch, warm_cache};
use netcache_ctl::metrics::Metrics;
use netcache_ctl::protocol::WireCodec;
use netcache_ctl::server::admin::{build_router, AdminState};
use netcache_ctl::server::backend::Backend;
use netcache_ctl::server::listener::BackendServer;
use netcache_ctl::switch::control::SharedControlPort;
use netcache_ctl::switch::memory::InMemorySwitch;
use netcache_ctl::switch::reset::MeasurementReset;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "netcache_ctl=debug,tower_http=debug"
    } else {
        "netcache_ctl=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("netcache-ctl v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }

    info!(
        lines = config.switch.lines,
        slots_per_line = config.switch.slots_per_line,
        slot_width = config.switch.slot_width,
        value_width = config.protocol.value_width,
        "Configuration loaded"
    );

    let metrics = Metrics::new()?;

    // Program the switch and build the controller side.
    let port: SharedControlPort = Arc::new(InMemorySwitch::from_config(&config.switch));
    configure_switch(port.as_ref(), &config.switch).await?;
    let directory = new_shared_directory(port.clone(), config.switch.clone());

    // Backend store, optionally pre-populated.
    let backend = Arc::new(Backend::new(&config, metrics.clone()));
    for path in &cli.data {
        if let Err(e) = backend.load_file(path).await {
            error!("{e}");
        }
    }
    if let Some(path) = &cli.cache {
        match backend.load_file(path).await {
            Ok(pairs) => {
                warm_cache(&directory, &pairs).await;
            }
            Err(e) => error!("{e}"),
        }
    }

    // Backend channels.
    let server = BackendServer::bind(config.server.listen, backend.clone(), &config).await?;

    // Controller report loop.
    let reports = UdpSocket::bind(config.controller.report_listen).await?;
    info!(addr = %reports.local_addr()?, "Controller listening for reports");
    let dispatcher = Arc::new(ReportDispatcher::new(directory.clone(), metrics.clone()));
    let report_loop = serve_reports(
        reports,
        dispatcher,
        WireCodec::new(config.protocol.value_width),
        config.controller.backend_addr,
        config.server.max_datagram,
    );

    // Measurement resets.
    tokio::spawn(MeasurementReset::new(port.clone(), &config.switch).run());

    // Admin API.
    let app = build_router(Arc::new(AdminState {
        backend,
        directory,
        metrics,
        start_time: Instant::now(),
    }));
    let admin = TcpListener::bind(config.server.admin_listen).await?;
    info!("Admin API listening on {}", config.server.admin_listen);

    tokio::select! {
        res = server.run() => res?,
        res = report_loop => res?,
        res = axum::serve(admin, app).into_future() => res?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
