//! guest-bridge
//!
//! `serve` runs the host meta-service for one task; `agent` runs inside the
//! guest, carrying out actions and the task itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use guest_bridge::agent::{self, ActionProcessor};
use guest_bridge::config::Config;
use guest_bridge::metaservice::{http, MetaService};
use guest_bridge::transport::{HttpTransport, TaskSpec, Transport};

/// How often the agent pings a host that is not up yet.
const PING_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "guest-bridge")]
#[command(about = "Action bridge between a sandbox host and its guest VM")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// JSON config file, used when GUEST_BRIDGE_CONFIG is unset
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Serve the meta-service for one task (host side)
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: SocketAddr,

        /// Keep serving callers after the task finishes, until interrupted
        #[arg(long)]
        keep_serving: bool,

        /// Task command run by the guest
        #[arg(last = true, required = true)]
        task: Vec<String>,
    },
    /// Process actions and run the task (guest side)
    Agent {
        /// Meta-service address as host:port
        #[arg(long)]
        host: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the task log in serve mode
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;

    let success = match args.command {
        Mode::Serve {
            listen,
            keep_serving,
            task,
        } => serve(config, listen, keep_serving, task).await?,
        Mode::Agent { host } => run_agent(config, &host).await?,
    };
    Ok(if success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn load_config(file: Option<&std::path::Path>) -> Result<Config> {
    if std::env::var_os(guest_bridge::config::CONFIG_ENV).is_some() {
        return Config::from_env();
    }
    file.map_or_else(|| Ok(Config::default()), Config::from_file)
}

async fn serve(config: Config, listen: SocketAddr, keep_serving: bool, command: Vec<String>) -> Result<bool> {
    let task = TaskSpec {
        command,
        env: HashMap::new(),
    };
    let meta = Arc::new(MetaService::new(config, task, Box::new(tokio::io::stdout())));
    let reaper = meta.start_reaper();

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {listen}"))?;
    info!(addr = %listener.local_addr()?, "Meta-service listening");

    let shutdown = CancellationToken::new();
    let server = {
        let shutdown = shutdown.clone();
        let app = http::router(Arc::clone(&meta));
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        })
    };

    let success = tokio::select! {
        result = meta.task_result() => result.context("Task result unavailable")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted before the task finished");
            false
        }
    };

    if keep_serving {
        info!("Task finished, serving until interrupted");
        tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;
    }

    meta.stop_pollers();
    shutdown.cancel();
    server.await.context("Server task panicked")?.context("Server failed")?;
    reaper.await.context("Reaper task panicked")?;
    Ok(success)
}

async fn run_agent(config: Config, host: &str) -> Result<bool> {
    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::new(host, config.clone()).context("Failed to build HTTP client")?);
    let processor = Arc::new(ActionProcessor::new(Arc::clone(&transport), config));

    info!(host, "Waiting for meta-service");
    processor
        .wait_for_host(PING_INTERVAL)
        .await
        .with_context(|| format!("Meta-service at {host} is not reachable"))?;

    let mut poller = {
        let processor = Arc::clone(&processor);
        tokio::spawn(async move { processor.process_actions().await })
    };

    let success = agent::run_task(&*transport).await?;

    // the host decides when it is done with us: it stops its pollers
    tokio::select! {
        joined = &mut poller => joined.context("Action processor panicked")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping action processing");
            processor.stop_processing_actions();
            poller.await.context("Action processor panicked")?;
        }
    }
    Ok(success)
}
