use anyhow::Context;
use bridge_server::{demo, router, serve_ports, AppState, DispatcherConfig, ServeOptions};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bridge-server", about = "Serve the demo method table over WebSocket relay ports")]
struct Cli {
    #[arg(long, env = "BRIDGE_ADDR", default_value = "0.0.0.0:7070")]
    addr: SocketAddr,

    /// Only ports opened with this name are served.
    #[arg(long, env = "BRIDGE_PORT_NAME", default_value = "bridge")]
    port_name: String,

    #[arg(long, env = "BRIDGE_CHANNEL")]
    channel: Option<String>,

    /// Run `init` as soon as a port connects.
    #[arg(long)]
    auto_init: bool,
}

// ─── Main ────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bridge_server=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // Panics outside method calls are forwarded to every connected caller.
    let mut config = DispatcherConfig::default().report_panics();
    if let Some(channel) = &cli.channel {
        config = config.with_channel(channel);
    }
    let options = ServeOptions::default()
        .with_config(config)
        .with_auto_init(cli.auto_init)
        .on_disconnect(|_updates| info!("Caller gone, dropping its update subscription"));

    let state = AppState::new();
    let _service = serve_ports(
        state.hub.clone(),
        &cli.port_name,
        Arc::new(demo::demo_table()),
        options,
    );

    let app = router(state);
    info!("🌉 Bridge Server listening on {}", cli.addr);

    let listener = tokio::net::TcpListener::bind(cli.addr)
        .await
        .with_context(|| format!("failed to bind {}", cli.addr))?;
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
