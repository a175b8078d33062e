mod cleanup;
mod converter;
mod distributor;
mod wiring;

use anyhow::Context;
use cleanup::CleanupScheduler;
use converter::GrpcConverter;
use distributor::{Distributor, Processor};
use drawbridge_core::config::{self, DistributorConfig};
use drawbridge_core::telemetry;
use drawbridge_registry::TaskRegistry;
use drawbridge_storage::{AsyncStore, FileStore, LocalStore, RemoteOptions, RemoteStore, RetryPolicy};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG_PATH: &str = "configs/distributor.yaml";
const REPLICATION_MAX_RETRIES: u32 = 3;
const SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init("info,drawbridge_distributor=debug,drawbridge_storage=debug");

    let cfg: DistributorConfig = config::load(DEFAULT_CONFIG_PATH)?;
    cfg.validate()?;

    let registry = Arc::new(
        TaskRegistry::connect(&cfg.redis.addr, &cfg.redis.password, cfg.redis.db)
            .await
            .context("connect to redis")?,
    );
    tracing::info!(addr = %cfg.redis.addr, "connected to redis");

    let local: Arc<dyn FileStore> = Arc::new(LocalStore::new(&cfg.base_dir).await?);
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
    tracing::info!(base_dir = %cfg.base_dir, "initialized file stores");

    let nats = drawbridge_queue::connect(
        &cfg.nats.url,
        &cfg.nats.queue_name,
        cfg.nats.max_reconnects,
    )
    .await
    .context("connect to nats")?;
    let js = drawbridge_queue::ensure_stream(nats.clone(), &cfg.nats.subject, 2 * cfg.task_ttl)
        .await?;
    let consumer = drawbridge_queue::pull_consumer(&js, &cfg.nats.subject, cfg.pool_size)
        .await
        .context("bind durable consumer")?;
    tracing::info!(url = %cfg.nats.url, subject = %cfg.nats.subject, "connected to queue");

    let grpc = GrpcConverter::connect(&cfg.converter_addr)
        .await
        .context("connect to converter")?;
    tracing::info!(addr = %cfg.converter_addr, "converter client ready");

    let task_ttl = chrono::Duration::from_std(cfg.task_ttl).context("task_ttl out of range")?;
    let token = CancellationToken::new();

    let processor = Arc::new(Processor::new(
        registry.clone(),
        Arc::new(grpc),
        cfg.conversion_timeout,
    ));
    let mut pool = Distributor::new(processor, consumer, cfg.pool_size, token.clone());
    pool.run();

    let scheduler = Arc::new(CleanupScheduler::new(
        registry,
        files.clone(),
        cfg.task_cleanup_interval,
        task_ttl,
    ));
    let cleanup_handle = scheduler.start(token.clone());
    tracing::info!(
        interval = ?cfg.task_cleanup_interval,
        "cleanup scheduler running"
    );

    shutdown_signal().await;
    tracing::info!("distributor shutting down...");

    token.cancel();
    pool.stop().await;
    let _ = cleanup_handle.await;

    if let Err(e) = nats.drain().await {
        tracing::warn!(error = %e, "queue drain failed");
    }
    files.close(SHUTDOWN_TIMEOUT).await?;

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
}
