use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use clap::Parser;
use futures::FutureExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ferrodhcp::config::Settings;
use ferrodhcp::database;
use ferrodhcp::dhcp::allocator::Allocator;
use ferrodhcp::dhcp::handler::Handler;
use ferrodhcp::dhcp::server::DhcpServer;
use ferrodhcp::dhcp::subnet::SubnetTable;
use ferrodhcp::dhcp::sweeper::ExpirySweeper;
use ferrodhcp::events::EventBus;
use ferrodhcp::gitops::sync::ReloadFn;
use ferrodhcp::gitops::{apply_local_reservations, GitOpsPoller, GitRepository, SyncService};
use ferrodhcp::store::cache::LeaseCache;
use ferrodhcp::store::LeaseStore;

/// Where the GitOps checkout lives, relative to the working directory.
const CHECKOUT_DIR: &str = "config-repo";

#[derive(Parser, Debug)]
#[command(name = "ferrodhcp")]
#[command(about = "Active/active DHCPv4 server backed by PostgreSQL", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/server.toml")]
    config: String,

    /// Run database migrations and exit.
    #[arg(long)]
    migrate: bool,
}

fn init_tracing(log_level: &str, log_format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ferrodhcp={log_level}")));
    let registry = tracing_subscriber::registry().with(filter);
    if log_format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let settings = Settings::load(&args.config).context("failed to load configuration")?;
    init_tracing(
        &settings.observability.log_level,
        &settings.observability.log_format,
    );
    info!("starting ferrodhcp (server_id {:?})", settings.server.server_id);

    settings.validate().context("configuration rejected")?;
    let settings = Arc::new(settings);

    let pool = database::init_pool(&settings.database)
        .await
        .context("database connection failed")?;

    if args.migrate {
        info!("running database migrations");
        database::run_migrations(&pool).await?;
        info!("migrations complete");
        return Ok(());
    }

    let store = Arc::new(LeaseStore::new(pool));
    let cache = settings
        .dhcp
        .cache_enabled
        .then(|| Arc::new(LeaseCache::new(settings.dhcp.cache_size)));
    let events = EventBus::new();

    let allocator = Allocator::new(
        Arc::clone(&store),
        cache.clone(),
        settings.server.server_id.clone(),
    );
    let handler = Handler::new(
        Arc::clone(&store),
        allocator,
        cache.clone(),
        Arc::clone(&events),
    );

    let subnets = SubnetTable::from_settings(&settings).context("invalid subnet configuration")?;
    let server = Arc::new(DhcpServer::new(
        &settings.dhcp.bind_address,
        settings.dhcp.port,
        handler,
        subnets,
        Duration::from_secs(settings.dhcp.shutdown_grace),
    )?);

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    let sweeper = ExpirySweeper::new(
        Arc::clone(&store),
        cache.clone(),
        Arc::clone(&events),
        Duration::from_secs(settings.dhcp.sweep_interval),
        ChronoDuration::days(settings.dhcp.lease_retention_days),
    );
    tasks.push(tokio::spawn({
        let cancel = cancel.clone();
        async move { sweeper.run(cancel).await }
    }));

    if settings.git.enabled {
        let git = settings.git.clone();
        let repo = tokio::task::spawn_blocking(move || {
            GitRepository::init(&git.repository, &git.branch, &git.auth, Path::new(CHECKOUT_DIR))
        })
        .await?
        .context("gitops repository init failed")?;

        let reload: ReloadFn = {
            let server = Arc::clone(&server);
            Arc::new(move |table| {
                let server = Arc::clone(&server);
                async move {
                    server.reload_subnets(table).await;
                    Ok(())
                }
                .boxed()
            })
        };

        let sync = Arc::new(SyncService::new(
            Arc::clone(&store),
            repo,
            settings.git.config_path.clone(),
            Duration::from_secs(settings.git.sync_timeout),
            settings.git.validate_before_sync,
            reload,
            Arc::clone(&events),
        ));
        let poller = GitOpsPoller::new(sync, Duration::from_secs(settings.git.poll_interval));
        tasks.push(tokio::spawn({
            let cancel = cancel.clone();
            async move { poller.run(cancel).await }
        }));
    } else if let Err(e) = apply_local_reservations(&store, &settings).await {
        warn!("local reservation sync failed: {}", e);
    }

    let server_task = tokio::spawn({
        let server = Arc::clone(&server);
        let cancel = cancel.clone();
        async move {
            if let Err(e) = server.run(cancel).await {
                error!("DHCP server failed: {}", e);
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    cancel.cancel();

    if let Err(e) = server_task.await {
        error!("server task join failed: {}", e);
    }
    for task in tasks {
        if let Err(e) = task.await {
            error!("background task join failed: {}", e);
        }
    }

    info!("shutdown complete");
    Ok(())
}
