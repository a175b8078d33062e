mod mock;
mod service;

use anyhow::Context;
use drawbridge_core::config::{self, ConverterConfig};
use drawbridge_core::telemetry;
use drawbridge_proto::ConverterServiceServer;
use drawbridge_storage::{AsyncStore, FileStore, LocalStore, RemoteOptions, RemoteStore, RetryPolicy};
use mock::MockConverter;
use service::ConverterGrpc;
use std::sync::Arc;

const DEFAULT_CONFIG_PATH: &str = "configs/converter.yaml";
const REPLICATION_MAX_RETRIES: u32 = 3;
const SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init("info,drawbridge_converter=debug,drawbridge_storage=debug");

    let cfg: ConverterConfig = config::load(DEFAULT_CONFIG_PATH)?;
    cfg.validate()?;

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

    let converter = Arc::new(MockConverter::new(
        files.clone() as Arc<dyn FileStore>,
        cfg.pool_size,
    ));
    let grpc = ConverterGrpc::new(converter);

    let addr: std::net::SocketAddr = cfg
        .grpc_addr
        .parse()
        .with_context(|| format!("invalid grpc_addr {}", cfg.grpc_addr))?;
    tracing::info!(addr = %addr, max_parallel = cfg.pool_size, "converter listening");

    tonic::transport::Server::builder()
        .add_service(ConverterServiceServer::new(grpc))
        .serve_with_shutdown(addr, shutdown_signal())
        .await?;

    files.close(SHUTDOWN_TIMEOUT).await?;
    tracing::info!("converter stopped");

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
