//! cloudop-agent: keeps provider resources in line with a manifest.
//!
//! Each pass reads the manifest, starts or polls the provider operations
//! needed to converge every resource, and persists pending operations in a
//! local SQLite database so a restarted agent resumes polling instead of
//! starting them again.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod agent;
mod clients;
mod manifest;
mod store;
#[cfg(test)]
mod test_util;

use agent::{AgentConfig, ResourceAgent};
use clients::ArmClient;
use store::SqliteStatusStore;

/// cloudop resource agent
#[derive(Parser, Debug)]
#[command(name = "cloudop-agent", version, about)]
struct Args {
    /// Path to the resource manifest (JSON)
    #[arg(long, default_value = "/etc/cloudop/manifest.json")]
    manifest: PathBuf,

    /// Provider endpoint (e.g., https://management.example.com/subscriptions/1234)
    #[arg(long)]
    provider_endpoint: String,

    /// Provider API version
    #[arg(long, default_value = "2023-09-01")]
    api_version: String,

    /// Directory for the operation status database
    #[arg(long, default_value = "/var/lib/cloudop")]
    state_dir: String,

    /// Agent name recorded on resource conditions (defaults to hostname)
    #[arg(long)]
    name: Option<String>,

    /// Seconds between polls of a pending operation
    #[arg(long, default_value = "15")]
    poll_interval: u64,

    /// Seconds between passes when nothing is pending
    #[arg(long, default_value = "60")]
    resync_interval: u64,

    /// Seconds an extension gets to answer a hook
    #[arg(long, default_value = "10")]
    hook_timeout: u64,

    /// Provider request timeout in seconds
    #[arg(long, default_value = "30")]
    request_timeout: u64,

    /// Run a single pass and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cloudop_agent=info,cloudop_async=info,cloudop_hooks=info,hyper=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let name = args.name.clone().unwrap_or_else(|| {
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    });

    info!("Starting cloudop-agent: {}", name);
    info!("Provider endpoint: {}", args.provider_endpoint);
    info!("Manifest: {}", args.manifest.display());

    tokio::fs::create_dir_all(&args.state_dir)
        .await
        .with_context(|| format!("Failed to create state dir {}", args.state_dir))?;
    let store = Arc::new(SqliteStatusStore::new(&args.state_dir).await?);
    info!("Status store: {}/status.db", args.state_dir);

    let client = ArmClient::new(
        &args.provider_endpoint,
        &args.api_version,
        Duration::from_secs(args.request_timeout),
    )?;

    let agent = ResourceAgent::new(
        client,
        store,
        AgentConfig {
            name,
            poll_interval: Duration::from_secs(args.poll_interval),
            hook_timeout: Duration::from_secs(args.hook_timeout),
        },
    );
    let resync = Duration::from_secs(args.resync_interval);

    loop {
        let wait = match run_pass(&agent, &args).await {
            Ok(wait) => wait,
            Err(e) => {
                error!("Pass failed: {:#}", e);
                resync
            }
        };

        if args.once {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    Ok(())
}

/// Apply the manifest once and return the delay before the next pass.
async fn run_pass(agent: &ResourceAgent, args: &Args) -> Result<Duration> {
    let manifest = manifest::load(&args.manifest).await?;
    let summary = agent.apply(&manifest).await?;
    Ok(summary.next_pass(Duration::from_secs(args.resync_interval)))
}
