use cape_sync::cache::local::LocalCache;
use cape_sync::channel::hub::SyncHub;
use cape_sync::channel::transport::{TcpAcceptor, TcpTransport};
use cape_sync::config::{BackendArgs, ProxyArgs, Role, SyncConfig};
use cape_sync::model::catalog::CapeCatalog;
use cape_sync::proxy::service::ProxyService;
use cape_sync::store::changelog::ChangeLog;
use cape_sync::store::memory::AssignmentStore;
use cape_sync::store::persistence::{FileBackend, PersistenceBackend};
use cape_sync::sync::agent::BackendNode;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SyncConfig::parse();

    match config.role.clone() {
        Role::Proxy(args) => run_proxy(&config, args).await,
        Role::Backend(args) => run_backend(&config, args).await,
    }
}

async fn run_proxy(config: &SyncConfig, args: ProxyArgs) -> anyhow::Result<()> {
    // 1. Authoritative state:
    let catalog = CapeCatalog::builtin();
    let store = Arc::new(AssignmentStore::new(catalog).with_history_limit(args.history_limit));
    let log = ChangeLog::with_retention(args.retention);
    let hub = SyncHub::new(
        args.queue_capacity,
        config.suspect_timeout(),
        config.dead_timeout(),
    );
    let persistence: Option<Arc<dyn PersistenceBackend>> = match &args.data_file {
        Some(path) => {
            tracing::info!("Persisting assignments to {}", path.display());
            let backend: Arc<dyn PersistenceBackend> = Arc::new(FileBackend::new(path.clone()));
            Some(backend)
        }
        None => {
            tracing::warn!("No data file configured, assignments live in memory only");
            None
        }
    };

    let service = ProxyService::new(store, log, hub.clone(), persistence);

    // 2. Load persisted state in the background; backends get RESYNC_FAILED
    //    until it is there.
    let loader = service.clone();
    let (base, cap) = (config.backoff_base(), config.backoff_cap());
    tokio::spawn(async move { loader.load_with_retry(base, cap).await });

    // 3. Failure detection:
    tokio::spawn(hub.clone().failure_detection_loop(config.heartbeat_interval()));

    // 4. Sync channel:
    let acceptor = TcpAcceptor::bind(args.sync_bind).await?;
    tracing::info!("Sync channel listening on {}", acceptor.local_addr()?);
    tokio::spawn(service.clone().serve_tcp(acceptor));

    // 5. Stats reporter:
    let stats_service = service.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        loop {
            interval.tick().await;
            let nodes = stats_service.hub().connected_nodes();
            tracing::info!(
                "Proxy stats: head #{}, {} connected nodes",
                stats_service.head(),
                nodes.len()
            );
            for node in nodes {
                tracing::info!(
                    "  - {} peer={} state={:?} last seen {}ms ago",
                    node.id,
                    node.peer,
                    node.state,
                    node.last_seen_ms_ago
                );
            }
        }
    });

    // 6. Admin API:
    let app = cape_sync::proxy::handlers::router(service);
    tracing::info!("Admin API listening on {}", args.admin_bind);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(args.admin_bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn run_backend(config: &SyncConfig, args: BackendArgs) -> anyhow::Result<()> {
    let cache = LocalCache::new(args.cache_ttl());
    let transport = Arc::new(TcpTransport::new(args.proxy));
    let node = BackendNode::new(
        args.backend_config(config),
        transport,
        cache,
        CapeCatalog::builtin(),
    );
    tracing::info!("Backend node {} following proxy {}", node.node_id(), args.proxy);

    node.start();

    let stats_node = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        loop {
            interval.tick().await;
            let status = stats_node.status().await;
            tracing::info!(
                "Backend stats: {} at #{}, {} cached ({} stale), {} applied, {} resyncs",
                status.engine.state,
                status.engine.cursor,
                status.engine.cache_size,
                status.engine.stale_entries,
                status.engine.stats.applied,
                status.engine.stats.resyncs_completed
            );
        }
    });

    let app = cape_sync::sync::handlers::router(node);
    tracing::info!("Status API listening on {}", args.status_bind);

    let listener = tokio::net::TcpListener::bind(args.status_bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
