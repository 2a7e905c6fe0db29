//! `lightboxd` — the media-processing daemon of the lightbox viewer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use lightbox_core::cache::CacheSizeManager;
use lightbox_core::notifications::{NOTIFICATION_QUEUE_DEPTH, NotificationSender};
use lightbox_core::pipeline::{BackgroundIndexer, DirectoryScanner, PipelineOrchestrator};
use lightbox_core::plugins::{
    CacheLayout, Cr3Plugin, ExifTool, PluginRegistry, StandardImagePlugin,
};
use lightbox_core::scheduler::TaskScheduler;
use lightbox_core::store::MetadataStore;
use lightbox_core::volume::VolumeHealth;
use lightbox_core::watcher::{LibraryWatcher, WatchGuard};
use lightbox_core::{ActiveSession, runtime};
use lightbox_daemon::{DaemonServer, InstanceLock, Listeners, spawn_bus};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "lightboxd", about = "lightbox media-processing daemon")]
struct Cli {
    /// Path to the configuration file (default: ~/.config/lightbox/config.toml).
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_env("LIGHTBOX_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => lightbox_config::load_from_path(path)?,
        None => lightbox_config::load()?,
    };
    init_tracing(&config.daemon.log_filter);
    info!("starting lightbox daemon");

    tokio::fs::create_dir_all(&config.cache.dir)
        .await
        .context("creating cache directory")?;

    // One daemon per cache tree. The lock lives until process exit.
    let _instance_lock = InstanceLock::acquire(&config.pid_file_path())?;

    // A crash leaves the socket file bound; bind() would fail without
    // removing it first.
    let socket_path = config.daemon.socket_path.clone();
    if socket_path.exists() {
        warn!(path = %socket_path.display(), "removing stale socket file");
        tokio::fs::remove_file(&socket_path).await.ok();
    }
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Bind early: the socket file is the GUI's readiness signal.
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;
    info!(path = %socket_path.display(), "socket bound");

    // Core wiring.
    let store = Arc::new(MetadataStore::open(&config.database_path()).await?);
    let (notifications, notification_queue) =
        NotificationSender::channel(NOTIFICATION_QUEUE_DEPTH);
    let scheduler = Arc::new(TaskScheduler::new(
        config.daemon.workers.max(1),
        notifications.clone(),
    ));
    runtime::init_store(Arc::clone(&store))?;
    runtime::init_scheduler(Arc::clone(&scheduler))?;

    let cache = Arc::new(
        CacheSizeManager::new(Arc::clone(&store), config.cache.max_size_mb).await?,
    );
    {
        let gate = Arc::clone(&cache);
        scheduler.set_cache_gate(Arc::new(move || gate.is_full()));
    }

    // Plugins register after the socket is bound so the GUI can start
    // connecting while availability checks (external tools) run.
    let layout = CacheLayout::create(&config.cache.dir, config.cache.thumbnail_size)?;
    let exiftool = Arc::new(ExifTool::new());
    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(StandardImagePlugin::new(layout.clone())));
    registry.register(Arc::new(Cr3Plugin::new(layout.clone(), Arc::clone(&exiftool))));
    let registry = Arc::new(registry);
    info!(formats = registry.supported_formats().len(), "plugins loaded");

    let volumes = Arc::new(VolumeHealth::new(&config.volumes));
    let active_session = ActiveSession::new();
    let watch_guard = Arc::new(WatchGuard::new());
    let pipeline = Arc::new(PipelineOrchestrator::new(
        Arc::clone(&scheduler),
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&cache),
        volumes,
        notifications.clone(),
        active_session.clone(),
        Arc::clone(&watch_guard),
        &config.scan,
    )?);
    let scanner = DirectoryScanner::new(registry.supported_formats(), &config.scan)?;

    scheduler.start();

    // Notification fan-out.
    let listeners = Arc::new(Listeners::new());
    let bus = spawn_bus(
        notification_queue,
        Arc::clone(&listeners),
        active_session.clone(),
    );

    // Live filesystem events.
    let watcher = LibraryWatcher::spawn(Arc::clone(&pipeline), &config.scan.watch_paths)?;

    // Startup maintenance: drop records for vanished files, then index
    // every watch path exactly once.
    pipeline.start_chunked_db_cleanup().await;
    BackgroundIndexer::new(
        Arc::clone(&scheduler),
        Arc::clone(&pipeline),
        scanner.clone(),
        config.scan.watch_paths.clone(),
    )
    .start_indexing();

    // Serve until a signal or a shutdown command arrives.
    let shutdown = CancellationToken::new();
    let server = Arc::new(DaemonServer::new(
        Arc::clone(&scheduler),
        Arc::clone(&pipeline),
        Arc::clone(&store),
        scanner,
        Arc::clone(&listeners),
        active_session,
        notifications,
        shutdown.clone(),
    ));
    let server_task = tokio::spawn(Arc::clone(&server).run(listener));

    wait_for_shutdown(&shutdown).await;

    info!("shutting down");
    scheduler.prepare_for_shutdown();
    shutdown.cancel();
    server_task.abort();
    watcher.stop();
    scheduler.shutdown(SHUTDOWN_TIMEOUT).await;
    exiftool.shutdown().await;
    bus.abort();
    tokio::fs::remove_file(&socket_path).await.ok();
    info!("daemon shutdown complete");
    Ok(())
}

async fn wait_for_shutdown(shutdown: &CancellationToken) {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(err) => {
            warn!(error = %err, "could not install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = shutdown.cancelled() => {}
            }
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = shutdown.cancelled() => {}
    }
}
