use runflow::api;
use runflow::config::Config;
use runflow::db;
use runflow::jobs::JobsRepo;
use runflow::runner::{ProcessSupervisor, WorkerPool};
use runflow::shutdown;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runflow=info,worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        worker_enabled = cfg.worker_enabled,
        max_concurrent = cfg.max_concurrent,
        poll_interval_ms = cfg.poll_interval_ms,
        run_timeout_secs = cfg.run_timeout_secs,
        runner = %cfg.runner_executable,
        script = %cfg.runner_script,
        log_dir = %cfg.log_dir.display(),
        api = %cfg.api_addr.clone().unwrap_or_else(|| "disabled".to_string()),
        migrate_on_startup = cfg.migrate_on_startup,
        "runflow starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let jobs_repo = JobsRepo::new(pool.clone());
    let shutdown = shutdown::install_shutdown_handler();

    // ---- API task ----
    let app = api::router(api::ApiState {
        jobs: jobs_repo.clone(),
    });
    let api_addr = cfg.api_addr.clone();
    let api_shutdown = shutdown.clone();

    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(%addr, "api listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
                .await?;
        } else {
            api_shutdown.cancelled().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Worker pool task ----
    let supervisor = ProcessSupervisor::new(cfg.runner());
    let pool_task = WorkerPool::new(jobs_repo, supervisor, cfg.worker(), shutdown.clone());
    let worker_handle = tokio::spawn(pool_task.run());

    // Both tasks end on the shutdown token; awaiting them (rather than
    // racing them) lets in-flight jobs drain before the process exits.
    let (api_res, worker_res) = tokio::join!(api_handle, worker_handle);
    api_res??;
    worker_res?;

    tracing::info!("runflow stopped");
    Ok(())
}
