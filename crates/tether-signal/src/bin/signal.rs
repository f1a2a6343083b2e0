//! Tether Signal Server
//!
//! WebSocket relay for device rendezvous and WebRTC negotiation.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (port 8080, transport probes)
//! tether-signal
//!
//! # Explicit config file, heartbeat liveness
//! tether-signal --config /etc/tether/signal.toml --liveness heartbeat
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tether_core::{Config, LivenessMode};
use tether_signal::SignalServer;

#[derive(Parser, Debug)]
#[command(name = "tether-signal")]
#[command(about = "Tether signaling relay for device rendezvous")]
#[command(version)]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Liveness detection: "probe" or "heartbeat"
    #[arg(long)]
    liveness: Option<LivenessMode>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn into_config(self) -> Result<Config, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => Config::load_from(path)?,
            None => Config::load(),
        };

        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(mode) = self.liveness {
            config.liveness.mode = mode;
        }
        if self.json_logs {
            config.logging.json = true;
        }
        Ok(config)
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let print_config = args.print_config;
    let config = args.into_config()?;

    if print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    init_logging(&config);

    let addr = SocketAddr::new(config.server.bind, config.server.port);

    info!("Starting Tether Signal Server");
    info!("Listening on {}", addr);

    let server = SignalServer::new(config);
    server.serve(addr).await?;

    Ok(())
}
