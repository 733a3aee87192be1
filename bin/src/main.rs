#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

mod config;

use config::{
    cli::{self, Parser},
    trace,
};
use leader_lease::{Coordinator, EtcdStore, KvStore, MemoryStore};
use tokio::{
    runtime::{Builder, Runtime},
    signal,
    sync::oneshot,
    task::JoinHandle,
};
use tracing::*;
use uuid::Uuid;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // load .env before parsing so it can provide any argument
    let dotenv = dotenv::dotenv();
    // parses from cli or environment var
    let config = cli::Config::parse();
    trace::init(&config.leaderd_log, config.log_format)?;
    debug!(?config);
    if let Err(err) = dotenv {
        debug!(?err, ".env file not loaded");
    }

    runtime(&config)?.block_on(async move {
        match tokio::spawn(start(config)).await {
            Err(err) => {
                error!(?err, "leaderd task failed");
                Err(anyhow!(err))
            }
            Ok(res) => res.inspect_err(|err| error!(?err, "exited with error")),
        }
    })
}

/// Multi-threaded runtime with named workers, one per logical CPU unless
/// `--threads` says otherwise.
fn runtime(config: &cli::Config) -> std::io::Result<Runtime> {
    let mut builder = Builder::new_multi_thread();
    builder.thread_name(&config.thread_name).enable_all();
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    builder.build()
}

async fn start(config: cli::Config) -> Result<()> {
    let store = connect_store(&config)?;
    let value = config
        .lease_value
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    info!(key = %config.lease_key, %value, "using lease value");

    let coordinator = Coordinator::new(store, config.lease_config(value))
        .context("invalid lease configuration")?;

    let token = CancellationToken::new();
    let (notify_tx, notify_rx) = oneshot::channel();
    let mut hold_task = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.acquire_and_hold(notify_tx).await }
    });
    let leader_task = spawn_leader_task(config.lease_key.clone(), notify_rx, token.clone());

    let result = tokio::select! {
        res = &mut hold_task => {
            let err = res.context("lease task failed")?;
            Err(anyhow::Error::new(err).context("leader lease lost"))
        }
        res = shutdown_signal(token.clone()) => {
            info!("shutdown signal received, releasing lease");
            // dropping the hold future also stops its watcher
            hold_task.abort();
            coordinator.release().await;
            res
        }
    };

    token.cancel();
    if let Err(err) = leader_task.await {
        error!(?err, "error waiting for leader task");
    }
    result
}

/// Pick the store backend from `--store`.
fn connect_store(config: &cli::Config) -> Result<Arc<dyn KvStore>> {
    if config.is_memory_store() {
        warn!("using in-memory store, the lease is only shared within this process");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = EtcdStore::new(&config.store, config.request_timeout())
        .with_context(|| format!("invalid etcd endpoint {:?}", config.store))?;
    info!(endpoint = %store.endpoint(), "using etcd store");
    Ok(Arc::new(store))
}

/// Runs while this process is the leader. Leader-only work hangs off here.
fn spawn_leader_task(
    key: String,
    acquired: oneshot::Receiver<()>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("leader task stopping before acquisition");
                return;
            }
            res = acquired => {
                if res.is_err() {
                    return;
                }
            }
        }
        info!(%key, "acting as leader");
        token.cancelled().await;
        info!(%key, "stepping down");
    })
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
