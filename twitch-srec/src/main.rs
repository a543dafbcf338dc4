use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use twitch_srec::capture::{CaptureEngine, CaptureRunner, StreamlinkConfig, StreamlinkEngine};
use twitch_srec::config::AppConfig;
use twitch_srec::persistence::{JsonStateStore, StateStore, spawn_persistence};
use twitch_srec::provision::{GithubReleaseProvisioner, ToolProvisioner};
use twitch_srec::reconciler::{Reconciler, ReconcilerConfig};
use twitch_srec::status::TwitchStatusProvider;
use twitch_srec::streamer::StreamerRegistry;
use twitch_srec::utils::http_client;
use twitch_srec::{console, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::parse();
    config.validate()?;

    let (logging, _guard) = logging::init_logging(&config.log_dir)?;
    let cancel_token = CancellationToken::new();
    logging.start_retention_cleanup(cancel_token.clone());

    info!("twitch-srec {} starting", env!("CARGO_PKG_VERSION"));

    let client = http_client::build_client(config.request_timeout())?;

    if config.update_tool {
        update_tool(&config, client.clone()).await;
    }

    // Registry
    let store: Arc<dyn StateStore> = Arc::new(JsonStateStore::new(&config.state_file));
    let registry = Arc::new(StreamerRegistry::new(&config.default_output_dir));
    match store
        .load()
        .await
        .with_context(|| format!("loading {}", config.state_file.display()))?
    {
        Some(state) => {
            registry.restore(state);
        }
        None => info!(
            "No saved state at {}, starting empty",
            config.state_file.display()
        ),
    }
    let persistence = spawn_persistence(
        registry.clone(),
        store,
        config.persist_debounce(),
        cancel_token.clone(),
    );

    // Capture engine
    let engine = Arc::new(
        StreamlinkEngine::detect(StreamlinkConfig {
            binary_path: config.streamlink_binary(),
            quality: config.quality.clone(),
            extra_args: config.streamlink_args.clone(),
        })
        .await?,
    );
    match engine.version() {
        Some(version) => info!("Using {}", version),
        None => warn!(
            "streamlink not found at {}, recordings will fail until it is installed (see --update-tool)",
            engine.config().binary_path.display()
        ),
    }
    let captures = Arc::new(CaptureRunner::new(engine, registry.clone()));

    // Reconciler
    let provider = Arc::new(TwitchStatusProvider::new(client, config.gql_url()?));
    let reconciler = Arc::new(Reconciler::new(
        registry.clone(),
        provider,
        captures,
        ReconcilerConfig {
            check_interval: config.check_interval(),
        },
    ));
    let reconciler_task = tokio::spawn(reconciler.clone().run());
    let console_task = tokio::spawn(console::run_console(
        reconciler.clone(),
        Some(logging.clone()),
        cancel_token.clone(),
    ));

    info!(
        "Tracking {} streamers, recording to {}",
        registry.len(),
        registry.location().display()
    );

    shutdown_signal().await;
    info!("Shutting down");

    reconciler.shutdown().await;
    cancel_token.cancel();
    if let Err(e) = reconciler_task.await {
        error!("Reconciler task failed: {}", e);
    }
    if let Err(e) = persistence.await {
        error!("Persistence task failed: {}", e);
    }
    // Blocked on stdin; it is not joined.
    console_task.abort();

    info!("Bye");
    Ok(())
}

async fn update_tool(config: &AppConfig, client: reqwest::Client) {
    let provisioner = match GithubReleaseProvisioner::new(client, &config.tool_dir) {
        Ok(provisioner) => provisioner,
        Err(e) => {
            error!("Cannot update streamlink: {}", e);
            return;
        }
    };

    match provisioner.check_needs_update().await {
        Ok(false) => {
            info!("streamlink is up to date");
            return;
        }
        Ok(true) => {}
        Err(e) => {
            warn!("Failed to check for streamlink updates: {}", e);
            return;
        }
    }

    let progress = |p: twitch_srec::provision::ProvisionProgress| {
        info!("{} {}", p.step, p.detail);
    };
    match provisioner.update(&progress).await {
        Ok(version) => info!("streamlink {} installed", version),
        Err(e) => error!("Failed to update streamlink: {}", e),
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
