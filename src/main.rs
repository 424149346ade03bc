use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

use morph_agent::config::Config;
use morph_agent::dispatch::Dispatcher;
use morph_agent::llm::RewriteClient;
use morph_agent::pipeline::RewritePipeline;
use morph_agent::registry::SessionRegistry;
use morph_agent::server::SessionServer;
use morph_agent::state::StateStore;

/// morph-agent - self-rewriting network agent
#[derive(Parser, Debug)]
#[command(name = "morph-agent", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Source artifact the rewrite pipeline operates on (overrides config)
    #[arg(long)]
    artifact: Option<PathBuf>,

    /// State snapshot file (overrides config)
    #[arg(long)]
    state_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(host) = args.host {
        config.listen.host = host;
    }
    if let Some(port) = args.port {
        config.listen.port = port;
    }
    if let Some(artifact) = args.artifact {
        config.artifact.path = artifact;
    }
    if let Some(state_file) = args.state_file {
        config.state_file = state_file;
    }

    let api_key = std::env::var(&config.llm.api_key_env).unwrap_or_default();
    if api_key.is_empty() {
        warn!(
            env = %config.llm.api_key_env,
            "no API key in environment, rewrite requests will fail"
        );
    }

    let store = Arc::new(StateStore::new(config.state_file.clone()));
    let state = Arc::new(RwLock::new(store.load()));
    let registry = Arc::new(SessionRegistry::new());
    let rewriter = Arc::new(RewriteClient::new(&config.llm, &api_key));
    let pipeline = Arc::new(RewritePipeline::new(
        config.artifact.path.clone(),
        config.artifact.backup_dir.clone(),
        rewriter,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        state.clone(),
        store.clone(),
        registry.clone(),
        pipeline.clone(),
    ));

    let agent_version = state.read().await.version.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = SessionServer::bind(
        &config.listen.host,
        config.listen.port,
        config.agent_name.clone(),
        agent_version,
        dispatcher,
        registry,
        shutdown_rx,
    )
    .await?;

    let mutations = state.read().await.mutation_count;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        mutations,
        artifact = %config.artifact.path.display(),
        "🧬 morph-agent starting"
    );

    let server_task = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    if let Err(e) = server_task.await {
        error!(error = %e, "server task failed");
    }

    // Persist last, holding the mutation gate so a rewrite still in flight
    // past the drain window commits (and persists) before this snapshot is
    // taken. Saving a stale snapshot here would regress the mutation count
    // behind an already-replaced artifact.
    let _mutation_gate = pipeline.quiesce().await;
    let snapshot = state.read().await;
    if let Err(e) = store.save(&snapshot) {
        error!(error = %e, "failed to persist state on shutdown");
    } else {
        info!("state persisted, goodbye");
    }
    Ok(())
}
