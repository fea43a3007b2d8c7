use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use room_relay::{
    cli::{Cli, Command},
    client,
    config::RelayConfig,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let config = RelayConfig::from(args);
            if config.uses_dev_secret() {
                warn!("JWT_SECRET is not set; using the development secret");
            }

            let relay = Arc::new(config.build_relay().await?);
            let listener = TcpListener::bind(config.listen)
                .await
                .with_context(|| format!("failed to bind {}", config.listen))?;
            let server = Server::new(listener, relay);
            let addr = server.local_addr()?;
            info!("relay listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("relay exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
