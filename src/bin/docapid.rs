use std::sync::Arc;

use clap::Parser;
use docapi::config::Config;
use docapi::engine::StoreHandle;
use docapi::policy::SecurityMode;
use docapi::server::{http, Dispatcher};
use log::{error, info};
use tokio::net::TcpListener;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// `memory:`, a data directory, or `file://<dir>`
    #[arg(short, long)]
    store: Option<String>,

    #[arg(short, long, env = "DOCAPI_PORT", default_value = "3000")]
    port: u16,

    /// open, owner-sandbox or read-all-write-own
    #[arg(long)]
    security: Option<SecurityMode>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::from_env()?;
    if let Some(store) = args.store {
        config.store_url = store;
    }
    if let Some(security) = args.security {
        config.security = security;
    }

    let handle = Arc::new(StoreHandle::new(config.store_url.clone()));
    // Open eagerly so a bad data directory fails at startup.
    handle.get().await?;

    info!(
        "Starting docapi daemon (store: {}, security: {}, mount: {})",
        handle.url(),
        config.security,
        if config.mount_path.is_empty() { "/" } else { &config.mount_path }
    );

    let dispatcher = Arc::new(Dispatcher::new(handle.clone(), config));
    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received. Finalizing disk writes...");
    };

    if let Err(e) = http::serve(listener, dispatcher, shutdown).await {
        error!("HTTP server failed: {}", e);
    }

    handle.flush().await?;
    info!("Persistence complete. Exiting.");
    Ok(())
}
