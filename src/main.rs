use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use podtail_agent::config::DEFAULT_CONFIG_PATH;
use podtail_agent::{
    JsonLinesSink, PodHandlerFactory, PodSetContext, PodSetTailer, RetryPolicy, load_config,
};
use podtail_k8s::PodWatcherOptions;
use podtail_logs::{PathFilter, PathWatcher, PathWatcherOptions, StateRecorder, TailerOptions};
use podtail_types::AgentConfig;

/// Podtail - tails the log files of the Kubernetes pods on this node
#[derive(Parser, Debug)]
#[command(name = "podtail")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the agent configuration file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,

    /// Node this agent runs on; only pods scheduled here are tailed
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Kubeconfig file (defaults to in-cluster config, then KUBECONFIG / ~/.kube/config)
    #[arg(long)]
    kubeconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let result = start(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn start(args: Args) -> Result<()> {
    let config = load_config(&args.config)
        .with_context(|| format!("Invalid configuration in {}", args.config.display()))?;

    if args.validate {
        println!("{}: configuration OK", args.config.display());
        return Ok(());
    }

    init_tracing(&config)?;
    run(args, config).await
}

/// `RUST_LOG` wins; otherwise the configured verbosity, then `info`
fn init_tracing(config: &AgentConfig) -> Result<()> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => tracing_subscriber::EnvFilter::try_new(
            config.verbosity.as_deref().unwrap_or("info"),
        )
        .context("Invalid verbosity")?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

async fn run(args: Args, config: AgentConfig) -> Result<()> {
    let wants_pods = config.watchers.iter().any(|w| w.label_selector.is_some());
    let node_name = args.node_name.as_deref().filter(|name| !name.is_empty());
    if wants_pods && node_name.is_none() {
        anyhow::bail!("--node-name (or NODE_NAME) is required to watch pods");
    }

    let state = match StateRecorder::open(&config.state_path) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(error = %format!("{:#}", anyhow::Error::new(e)), "running without offset persistence");
            None
        }
    };

    let path_options = PathWatcherOptions {
        check_interval: config.reconcile_interval(),
        tailer: TailerOptions {
            poll_interval: config.poll_interval(),
            checkpoint_interval: config.checkpoint_interval(),
            read_from: config.read_from,
        },
    };
    let sink = JsonLinesSink::stdout();

    // Static paths
    let mut path_watchers = Vec::new();
    for watcher in &config.watchers {
        for pattern in &watcher.paths {
            let filter = PathFilter::new()
                .with_excludes(&watcher.exclude_paths)
                .context("Invalid exclude pattern")?;
            info!(%pattern, "watching static path");
            path_watchers.push(
                PathWatcher::new(
                    Box::new(pattern.clone()),
                    filter,
                    sink.for_paths(),
                    state.clone(),
                    path_options.clone(),
                )
                .start(),
            );
        }
    }

    // Pods
    let mut pod_sets = Vec::new();
    if let Some(node_name) = node_name.filter(|_| wants_pods) {
        let client = podtail_k8s::connect(args.kubeconfig.as_deref()).await?;
        let handlers: Arc<dyn PodHandlerFactory> = Arc::new(sink.clone());

        for (index, watcher) in config.watchers.iter().enumerate() {
            if watcher.label_selector.is_none() {
                continue;
            }

            let ctx = PodSetContext {
                watcher: watcher.clone(),
                base_log_dir: config.base_log_dir.clone(),
                legacy_log_paths: config.legacy_log_paths,
                state: state.clone(),
                handlers: Arc::clone(&handlers),
                path_options: path_options.clone(),
                pod_options: PodWatcherOptions {
                    event_buffer: config.event_buffer,
                    resync_interval: config.resync_interval(),
                },
                retry: RetryPolicy {
                    max_retries: config.pod_retry_limit,
                    base_delay: config.pod_retry_delay(),
                },
            };

            // one bad selector must not take the other watchers down
            match PodSetTailer::connect(client.clone(), node_name, ctx).await {
                Ok(tailer) => pod_sets.push(tailer),
                Err(e) => error!(watcher = index, error = %format!("{:#}", e), "failed to start pod watcher"),
            }
        }
    }

    if path_watchers.is_empty() && pod_sets.is_empty() {
        anyhow::bail!("Nothing to watch: no watcher could be started");
    }

    info!(
        static_paths = path_watchers.len(),
        pod_sets = pod_sets.len(),
        node = node_name.unwrap_or("-"),
        "podtail agent running"
    );

    if let Err(e) = shutdown_signal().await {
        error!(error = %format!("{:#}", e), "failed to wait for shutdown signal");
    }
    info!("shutting down");

    for mut tailer in pod_sets {
        tailer.stop().await;
    }
    for watcher in path_watchers {
        watcher.stop().await;
    }

    if let Some(state) = state {
        state.flush().context("Failed to flush offsets")?;
    }
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    Ok(())
}
