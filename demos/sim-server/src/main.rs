//! Bridge server backed by the simulated engine.
//!
//! Run with: cargo run -p sim-server -- --bind 127.0.0.1:3000
//!
//! Then drive it over `POST /call` or the `/ws` socket, e.g.
//! `{"op": "create_session", "pid": 1234}`.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use hookbridge_core::{BridgeConfig, Platform, sim::SimPlatform};
use hookbridge_session::SessionRegistry;
use hookbridge_transport::{Dispatcher, websocket::router};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "sim-server")]
#[command(about = "Serve the instrumentation bridge against a simulated engine")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "HOOKBRIDGE_BIND", default_value = "127.0.0.1:3000")]
    bind: SocketAddr,

    /// JSON config file; environment variables override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => BridgeConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BridgeConfig::default(),
    }
    .with_env_overrides()?;

    let platform = SimPlatform::with_defaults();
    if let Some(usb) = platform.device("sim-usb") {
        usb.add_process(1234, "Target");
        usb.add_application("com.example.notes", "Notes", Some(4321));
        usb.set_frontmost("com.example.notes");
    }
    if let Some(local) = platform.device("local") {
        local.add_process(std::process::id(), "sim-server");
    }
    let platform: Arc<dyn Platform> = Arc::new(platform);

    let registry = Arc::new(SessionRegistry::new(platform, config));
    let app = router(Dispatcher::new(Arc::clone(&registry)));

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("binding {}", cli.bind))?;
    tracing::info!("Server listening on http://{}", cli.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    registry.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}
