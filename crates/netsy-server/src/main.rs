//! The netsy binary.
//!
//! Startup order matters: open the index, query object storage for the
//! newest snapshot, backfill the index from snapshot + chunks, verify
//! integrity, and only then start the snapshot worker and serve the etcd
//! API. Unrecoverable startup errors sleep a bounded random interval before
//! exiting so a crash-looping supervisor does not hammer S3.

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use tonic::transport::Server;
use tracing::{error, info};

use netsy_index::LocalIndex;
use netsy_proto::etcdserverpb::{
    cluster_server::ClusterServer, kv_server::KvServer, maintenance_server::MaintenanceServer,
    watch_server::WatchServer,
};
use netsy_s3::S3Store;
use netsy_server::config::Config;
use netsy_server::error::ServerError;
use netsy_server::services::EtcdService;
use netsy_server::snapshot::{SnapshotThresholds, SnapshotWorker};
use netsy_server::txn::TxnEngine;
use netsy_server::watch::WatchHub;
use netsy_server::{backfill, tls};

#[tokio::main]
async fn main() {
    let config = Config::parse();

    let default_filter = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    if let Err(err) = run(config).await {
        error!(error = %err, "fatal error");
        jitter_wait_then_exit();
    }
}

async fn run(config: Config) -> Result<(), ServerError> {
    config.validate()?;

    std::fs::create_dir_all(&config.data_dir)?;

    info!(path = %config.db_path().display(), "opening local index");
    let index = Arc::new(LocalIndex::open(config.db_path()).await?);
    let local_latest = index.latest_revision().await?;

    // Object storage and the snapshot worker only exist when S3 is enabled;
    // without it the server is a purely local development instance.
    let mut s3_store = None;
    let mut latest_snapshot = None;
    let mut snapshot_parts = None;
    if config.s3_enabled {
        let store = config.build_object_store()?;
        let s3 = Arc::new(S3Store::new(
            store,
            config.s3_key_prefix(),
            config.instance_id.clone(),
        ));
        info!(bucket = %config.s3_bucket_name, region = %config.s3_region, "S3 client initialized");

        latest_snapshot = s3.get_latest_snapshot().await?;

        let thresholds = SnapshotThresholds {
            records: config.snapshot_threshold_records,
            size_mb: config.snapshot_threshold_size_mb,
            age_minutes: config.snapshot_threshold_age_minutes,
        };
        let (handle, worker) = SnapshotWorker::new(
            Arc::clone(&index),
            Arc::clone(&s3),
            thresholds,
            config.data_dir.clone(),
            config.instance_id.clone(),
        );
        worker.initialize_from_snapshot(latest_snapshot.as_ref());

        s3_store = Some(s3);
        snapshot_parts = Some((handle, worker));
    }

    backfill::backfill(
        &index,
        s3_store.as_deref(),
        &config.data_dir,
        latest_snapshot.as_ref(),
        local_latest,
    )
    .await?;
    index.verify_integrity().await?;

    // The worker starts only after backfill so it never snapshots a
    // half-rebuilt index.
    let (snapshot_handle, worker_shutdown, worker_task) = match snapshot_parts {
        Some((handle, worker)) => {
            let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
            let task = worker.start(shutdown_rx);
            (Some(handle), Some(shutdown_tx), Some(task))
        }
        None => (None, None, None),
    };

    let engine = Arc::new(
        TxnEngine::new(
            Arc::clone(&index),
            s3_store.clone(),
            snapshot_handle,
            config.instance_id.clone(),
        )
        .await?,
    );
    let hub = Arc::new(WatchHub::new());
    let service = Arc::new(EtcdService::new(
        engine,
        Arc::clone(&index),
        Arc::clone(&hub),
        config.listen_clients_addr.clone(),
    ));

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_service_status("", tonic_health::ServingStatus::Serving)
        .await;

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(netsy_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .map_err(|err| ServerError::Config(format!("failed to build reflection service: {err}")))?;

    let addr: SocketAddr = config
        .listen_clients_addr
        .parse()
        .map_err(|err| ServerError::Config(format!("invalid listen address: {err}")))?;

    let mut builder = Server::builder().tls_config(tls::load_server_tls(&config)?)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
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
            _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
            _ = terminate => info!("received SIGTERM, initiating graceful shutdown"),
        }
        let _ = shutdown_tx.send(());
    });

    info!(addr = %addr, "starting client (grpc) server");
    builder
        .add_service(health_service)
        .add_service(reflection_service)
        .add_service(KvServer::from_arc(Arc::clone(&service)))
        .add_service(WatchServer::from_arc(Arc::clone(&service)))
        .add_service(MaintenanceServer::from_arc(Arc::clone(&service)))
        .add_service(ClusterServer::from_arc(Arc::clone(&service)))
        .serve_with_shutdown(addr, async {
            shutdown_rx.await.ok();
        })
        .await?;

    info!("shutting down");
    if let Some(shutdown) = worker_shutdown {
        let _ = shutdown.send(());
    }
    if let Some(task) = worker_task {
        let _ = task.await;
    }
    index.close().await;
    info!("exiting");
    Ok(())
}

/// Sleep a random 0-10 s before exiting non-zero to dampen restart loops.
fn jitter_wait_then_exit() -> ! {
    let wait = Duration::from_secs(rand::thread_rng().gen_range(0..10));
    info!(wait_secs = wait.as_secs(), "waiting before exiting");
    std::thread::sleep(wait);
    process::exit(1);
}
