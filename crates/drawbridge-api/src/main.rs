mod error;
mod handlers;
mod service;
mod state;
mod wiring;

use anyhow::Context;
use drawbridge_core::config::{self, ApiConfig};
use drawbridge_core::telemetry;
use drawbridge_registry::TaskRegistry;
use drawbridge_storage::{AsyncStore, FileStore, LocalStore, RemoteOptions, RemoteStore, RetryPolicy};
use service::ConvertService;
use state::AppState;
use std::sync::Arc;

const DEFAULT_CONFIG_PATH: &str = "configs/api.yaml";
const REPLICATION_MAX_RETRIES: u32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init("info,drawbridge_api=debug,drawbridge_storage=debug");

    let cfg: ApiConfig = config::load(DEFAULT_CONFIG_PATH)?;
    cfg.validate()?;

    let local: Arc<dyn FileStore> = Arc::new(LocalStore::new(&cfg.base_dir).await?);
    tracing::info!(base_dir = %cfg.base_dir, "initialized local file store");

    let remote: Arc<dyn FileStore> = Arc::new(
        RemoteStore::connect(
            RemoteOptions {
                endpoint: cfg.minio.endpoint.clone(),
                access_key_id: cfg.minio.access_key_id.clone(),
                secret_access_key: cfg.minio.secret_access_key.clone(),
                use_ssl: cfg.minio.use_ssl,
                bucket: cfg.minio.bucket.clone(),
                base_path: cfg.base_dir.clone(),
            },
            RetryPolicy::default(),
        )
        .await?,
    );
    tracing::info!(
        endpoint = %cfg.minio.endpoint,
        bucket = %cfg.minio.bucket,
        "initialized remote file store"
    );

    let files = Arc::new(
        AsyncStore::new(
            local,
            remote,
            cfg.queue_capacity,
            cfg.pool_size,
            REPLICATION_MAX_RETRIES,
        )
        .await,
    );
    tracing::info!(
        queue_capacity = cfg.queue_capacity,
        pool_size = cfg.pool_size,
        "using write-through file store"
    );

    let registry = TaskRegistry::connect(&cfg.redis.addr, &cfg.redis.password, cfg.redis.db)
        .await
        .context("connect to redis")?;
    tracing::info!(addr = %cfg.redis.addr, "connected to redis");

    let nats = drawbridge_queue::connect(
        &cfg.nats.url,
        &cfg.nats.queue_name,
        cfg.nats.max_reconnects,
    )
    .await
    .context("connect to nats")?;
    let js = drawbridge_queue::ensure_stream(nats, &cfg.nats.subject, 2 * cfg.task_ttl).await?;
    let publisher = drawbridge_queue::Publisher::new(js, cfg.nats.subject.clone());
    tracing::info!(url = %cfg.nats.url, subject = %cfg.nats.subject, "connected to queue");

    let service = Arc::new(ConvertService::new(
        chrono::Duration::from_std(cfg.task_ttl).context("task_ttl out of range")?,
        Arc::new(registry),
        files.clone() as Arc<dyn FileStore>,
        Arc::new(publisher),
    ));

    let app = handlers::router(
        AppState { service },
        (cfg.max_upload_mb << 20) as usize,
    );

    let listener = tokio::net::TcpListener::bind(&cfg.addr)
        .await
        .with_context(|| format!("bind {}", cfg.addr))?;
    tracing::info!(addr = %cfg.addr, max_upload_mb = cfg.max_upload_mb, "ingress listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    files.close(cfg.shutdown_timeout).await?;
    tracing::info!("ingress stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received terminate signal"),
    }

    tracing::info!("shutting down gracefully...");
}
