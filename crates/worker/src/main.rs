use deployflow::admin;
use deployflow::clients::{CliImageBuilder, CloudRest, GitCli, HttpRegistry, KubeRest, RetryingInfra};
use deployflow::config;
use deployflow::db;
use deployflow::events::PgNotifyChannel;
use deployflow::jobs::retry::RetryConfig;
use deployflow::jobs::PgJobQueue;
use deployflow::pipelines::PipelineContext;
use deployflow::store::PgStore;
use deployflow::worker::WorkerPool;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    deployflow::telemetry::init_tracing();
    let cfg = config::Config::from_env()?;

    info!(
        worker_id = %cfg.worker_id,
        workers = cfg.workers,
        lease_seconds = cfg.lease_seconds,
        reap_interval_seconds = cfg.reap_interval_seconds,
        admin = cfg.admin_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        "deployflow worker starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let store = Arc::new(PgStore::new(pool.clone()));
    let queue = Arc::new(PgJobQueue::new(pool.clone()));

    let infra = RetryingInfra::new(
        CloudRest::new(&cfg.infra_url, &cfg.infra_token)?,
        cfg.infra_max_retries,
        RetryConfig {
            base: Duration::from_secs(1),
            max: Duration::from_secs(20),
            ..RetryConfig::default()
        },
    );

    let ctx = PipelineContext {
        store: store.clone(),
        queue: queue.clone(),
        source: Arc::new(GitCli::new(&cfg.git_api_base)?),
        builder: Arc::new(CliImageBuilder::default()),
        registry: Arc::new(HttpRegistry::new(cfg.registry_token.clone())?),
        orchestrator: Arc::new(KubeRest::new(&cfg.orchestrator_url, &cfg.orchestrator_token)?),
        infra: Arc::new(infra),
        live: Arc::new(PgNotifyChannel::new(pool.clone())),
        settings: cfg.pipeline_settings(),
    };

    // ---- Admin API task ----
    let app = admin::router(admin::AdminState {
        queue: queue.clone(),
        store: store.clone(),
    });
    let api_addr = cfg.admin_addr.clone();
    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(%addr, "admin api listening");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Worker pool task ----
    let shutdown = CancellationToken::new();
    let pool_runner = WorkerPool::new(ctx, cfg.pool_config());
    let abort = pool_runner.abort_token();
    let worker_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pool_runner.run(shutdown).await })
    };

    tokio::select! {
        res = api_handle => {
            res??;
            warn!("admin api stopped, shutting down workers");
            shutdown.cancel();
        }
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, draining in-flight jobs (press again to abort them)");
            shutdown.cancel();
        }
    }

    let mut worker_handle = worker_handle;
    tokio::select! {
        res = &mut worker_handle => res?,
        _ = tokio::signal::ctrl_c() => {
            warn!("second ctrl-c, aborting in-flight jobs");
            abort.cancel();
            worker_handle.await?;
        }
    }

    info!("deployflow worker stopped");
    Ok(())
}
