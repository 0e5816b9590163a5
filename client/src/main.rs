//! `bridge-call`: calls one method on a bridge server through a
//! reconnecting WebSocket relay port and prints updates, progress and the
//! result as JSON.

use anyhow::Context;
use bridge_client::{
    ConnectorConfig, Handlers, PortAdapter, PortAdapterConfig, ProgressCallback, Request,
    WsPortOpener,
};
use bridge_protocol::Value;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bridge-call", about = "Call a method on a bridge server")]
struct Cli {
    /// Base URL of the relay ports; the port name is appended.
    #[arg(long, env = "BRIDGE_SERVER_URL", default_value = "ws://127.0.0.1:7070/port")]
    server_url: String,

    #[arg(long, env = "BRIDGE_PORT_NAME", default_value = "bridge")]
    port_name: String,

    #[arg(long, env = "BRIDGE_CHANNEL")]
    channel: Option<String>,

    /// Ask the method to stream progress.
    #[arg(long)]
    progress: bool,

    /// Cancel the progress stream after this many seconds, or give up
    /// waiting if the call does not stream.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Argument sent with `init` before the call. Repeatable.
    #[arg(long = "init", value_name = "JSON")]
    init_args: Vec<String>,

    method: String,

    /// Method arguments. Each is parsed as JSON; anything else is a string.
    args: Vec<String>,
}

fn parse_args(raw: &[String]) -> Vec<Value> {
    raw.iter()
        .map(|arg| {
            serde_json::from_str::<serde_json::Value>(arg)
                .unwrap_or_else(|_| serde_json::Value::String(arg.clone()))
                .into()
        })
        .collect()
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("<unprintable: {e}>"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bridge_call=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut connector = ConnectorConfig::default();
    if let Some(channel) = &cli.channel {
        connector = connector.with_channel(channel);
    }
    let config = PortAdapterConfig::new(&cli.port_name).with_connector(connector);
    let handlers = Handlers::default()
        .on_update(|update| println!("update: {}", to_json(&update)))
        .on_unhandled_error(|err| eprintln!("remote error: {}", err));

    let opener = Arc::new(WsPortOpener::new(&cli.server_url));
    let adapter = PortAdapter::spawn(opener, config, handlers);
    adapter.wait_connected().await;
    info!("Calling {} on port {}", cli.method, cli.port_name);

    if !cli.init_args.is_empty() {
        adapter.init(parse_args(&cli.init_args))?;
    }

    let mut request = Request::new(&cli.method).args(parse_args(&cli.args));
    let progress = cli.progress.then(|| {
        ProgressCallback::new(|args| println!("progress: {}", to_json(&args)))
    });
    if let Some(progress) = &progress {
        request = request.with_progress(progress.clone());
    }

    let mut pending = adapter
        .request(request)
        .with_context(|| format!("failed to send {}", cli.method))?;

    let outcome = match cli.timeout_secs {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), &mut pending).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let Some(progress) = &progress else {
                    anyhow::bail!("no response to {} within {}s", cli.method, secs);
                };
                info!("Canceling progress of {} after {}s", cli.method, secs);
                adapter.cancel_callback(progress)?;
                pending.await
            }
        },
        None => pending.await,
    };

    let value = outcome.with_context(|| format!("{} failed", cli.method))?;
    println!("{}", to_json(&value));
    adapter.shutdown();
    Ok(())
}
