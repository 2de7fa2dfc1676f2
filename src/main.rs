//! msgbroker server
//!
//! Loads the configuration, recovers durable queues, then serves the protocol
//! on TCP (and WebSocket when `server.ws_port` is set) until Ctrl-C.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use msgbroker::broker::Broker;
use msgbroker::config::{Settings, load_config_from};
use msgbroker::persistence::open_store;
use msgbroker::transport::ServerContext;
use msgbroker::transport::tcp::start_tcp_server;
use msgbroker::transport::websocket::start_websocket_server;
use msgbroker::utils::logging;

#[derive(Parser, Debug)]
#[command(name = "msgbroker", version, about = "Pub/sub and queue message broker")]
struct Cli {
    /// Configuration file (defaults to config/default.* when present)
    #[arg(long, short)]
    config: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Also serve the protocol over WebSocket on this port
    #[arg(long)]
    ws_port: Option<u16>,
    /// Directory of the durable queue store
    #[arg(long)]
    data_dir: Option<String>,
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(self, settings: &mut Settings) {
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if self.ws_port.is_some() {
            settings.server.ws_port = self.ws_port;
        }
        if let Some(dir) = self.data_dir {
            settings.persistence.path = dir;
        }
        if let Some(level) = self.log_level {
            settings.log.level = level;
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut settings = match load_config_from(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(2);
        }
    };
    cli.apply(&mut settings);
    logging::init(&settings.log.level);

    if let Err(e) = run_server(settings).await {
        error!("Server failed: {e}");
        std::process::exit(1);
    }
}

async fn run_server(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(&settings.persistence)?;
    let broker = Arc::new(Broker::new(settings.broker.clone(), store));

    let restored = broker.recover().await?;
    info!("Recovered {restored} queued message(s)");

    let shutdown = CancellationToken::new();
    tokio::spawn(Arc::clone(&broker).run_ack_sweeper(shutdown.clone()));
    tokio::spawn(Arc::clone(&broker).run_status_reporter(shutdown.clone()));

    let ctx = ServerContext::new(
        Arc::clone(&broker),
        settings.server.max_connections,
        settings.server.max_frame_bytes,
        shutdown.clone(),
    );

    if let Some(ws_port) = settings.server.ws_port {
        let addr = format!("{}:{ws_port}", settings.server.host);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_websocket_server(&addr, ctx).await {
                error!("WebSocket server on {addr} failed: {e}");
            }
        });
    }

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let result = tokio::select! {
        result = start_tcp_server(&addr, ctx) => {
            error!("TCP server exited unexpectedly.");
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            Ok(())
        }
    };

    shutdown.cancel();
    broker.flush().await?;
    result?;
    Ok(())
}
