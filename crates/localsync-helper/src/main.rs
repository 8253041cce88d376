//! Localsync Helper - child process of a local sync.
//!
//! Spawned by the parent agent with the control channel address and the
//! shared buffer handles in its environment. Exits with 0 if the session
//! completed, 1 otherwise.

use anyhow::{bail, Context, Result};
use clap::Parser;
use localsync_core::{forwarding_layer, ChildAgent, ChildEnvironment, EnvVars, LogForwarder};
use localsync_helper::ItemExchangeFactory;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "localsync-helper")]
#[command(about = "Child side of a local sync, started by the local transport")]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let forwarder = init_logging(args.debug || std::env::var_os(EnvVars::DEBUG).is_some());

    let Some(env) = ChildEnvironment::from_env()? else {
        bail!(
            "{} is not set; this program is started by the local transport",
            EnvVars::CONTROL_ADDR
        );
    };

    if let Some(delay) = std::env::var(EnvVars::CHILD_DELAY)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        info!("Waiting {} seconds before connecting, pid {}", delay, std::process::id());
        tokio::time::sleep(Duration::from_secs(delay)).await;
    }

    let child = ChildAgent::connect(&env)
        .await
        .context("Failed to connect to local sync parent")?;
    forwarder.attach(child.channel().clone());
    debug!("Local sync child running, pid {}", std::process::id());

    let code = child.run(&ItemExchangeFactory).await;
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

/// Log to the parent once connected; stderr only gets warnings unless debugging.
fn init_logging(debug: bool) -> LogForwarder {
    let default_level = if debug { "debug" } else { "info" };
    let stderr_level = if debug { LevelFilter::DEBUG } else { LevelFilter::WARN };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let (layer, forwarder) = forwarding_layer();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact()
                .with_filter(stderr_level),
        )
        .with(layer)
        .init();
    forwarder
}
