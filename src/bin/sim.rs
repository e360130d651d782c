//! In-process cluster simulator

use clap::Parser;
use minicoord::common::{parse_duration, retry_with_backoff, Config};
use minicoord::recipes::{DistributedLock, LockKind};
use minicoord::store::{CoordinationStore, MemoryStore};
use minicoord::{Error, LocalCluster};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minicoord-sim")]
#[command(about = "Run a minicoord cluster inside one process")]
#[command(version)]
struct Cli {
    /// Number of consensus nodes
    #[arg(long, default_value = "3")]
    nodes: usize,

    /// Commands to propose
    #[arg(long, default_value = "10")]
    commands: usize,

    /// Cut the leader off halfway through, then heal
    #[arg(long)]
    isolate_leader: bool,

    /// Time to let the cluster settle before reporting (e.g. 500ms, 2s)
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    settle: Duration,

    /// Config file (defaults to minicoord.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the heartbeat interval
    #[arg(long)]
    heartbeat_ms: Option<u64>,

    /// Keep consensus logs on disk under this directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Store clients contending for one lock after the proposals
    #[arg(long, default_value = "3")]
    lock_clients: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.nodes == 0 {
        anyhow::bail!("--nodes must be at least 1");
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(ms) = cli.heartbeat_ms {
        config.consensus.heartbeat_interval_ms = ms;
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    config.validate()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("minicoord {} starting {} nodes", minicoord::BUILD_INFO, cli.nodes);
    let cluster = LocalCluster::start_with_config(cli.nodes, &config)?;
    let election_wait = config.consensus.election_timeout_max() * 20;

    let no_leader = move || Error::Timeout(format!("no leader within {:?}", election_wait));

    let leader = cluster
        .wait_for_leader(election_wait)
        .await
        .ok_or_else(no_leader)?;
    tracing::info!("Leader {} in term {}", leader.id(), leader.term());

    let split_at = if cli.isolate_leader {
        cli.commands / 2
    } else {
        cli.commands
    };
    let mut committed = 0;
    let mut isolated = None;
    let mut stranded = None;

    for i in 0..cli.commands {
        if i == split_at && isolated.is_none() {
            let old = cluster
                .wait_for_leader(election_wait)
                .await
                .ok_or_else(no_leader)?;
            cluster.network().isolate(old.id());
            let replacement = cluster
                .wait_for_leader_after(old.term(), election_wait)
                .await
                .ok_or_else(no_leader)?;
            tracing::info!(
                "Leader {} isolated, {} took over in term {}",
                old.id(),
                replacement.id(),
                replacement.term()
            );

            stranded = Some(old.propose(b"stranded".to_vec()).await);
            isolated = Some(old.id().to_string());
        }

        let command = format!("set k{} {}", i, i).into_bytes();
        let cluster_ref = &cluster;
        let accepted = retry_with_backoff(
            || {
                let command = command.clone();
                async move {
                    let leader = cluster_ref
                        .wait_for_leader(election_wait)
                        .await
                        .ok_or_else(no_leader)?;
                    leader.propose(command).await
                }
            },
            5,
            Duration::from_millis(100),
        )
        .await?;
        if accepted {
            committed += 1;
        }
    }

    if let Some(leader) = cluster.wait_for_leader(election_wait).await {
        if let Some(replicator) = cluster.replicator(leader.id()) {
            match replicator
                .update_state("sim/committed", json!(committed))
                .await
            {
                Ok(state) => tracing::info!("Replicated {} v{}", state.key, state.version),
                Err(e) => tracing::warn!("State replication failed: {}", e),
            }
        }
    }

    if let Some(id) = &isolated {
        cluster.network().heal();
        tracing::info!("Healed {}", id);
        if let Some(manager) = cluster.recovery_manager(id) {
            match manager.recover_state().await {
                Ok(updated) => tracing::info!("{} recovered {} keys", id, updated),
                Err(e) => tracing::warn!("{} did not recover: {}", id, e),
            }
        }
    }

    let lock_acquisitions = contend_for_lock(&config, cli.lock_clients).await?;

    tokio::time::sleep(cli.settle).await;

    let nodes: Vec<_> = cluster
        .nodes()
        .iter()
        .map(|node| {
            json!({
                "status": node.status(),
                "applied": cluster.applied(node.id()).len(),
                "state": cluster.replicator(node.id()).map(|r| r.snapshot()),
            })
        })
        .collect();

    let report = json!({
        "version": minicoord::VERSION,
        "finished_at": chrono::Utc::now().to_rfc3339(),
        "nodes": cli.nodes,
        "proposed": cli.commands,
        "committed": committed,
        "isolated": isolated,
        "stranded_proposal": stranded.map(|r| match r {
            Ok(kept) => json!({ "committed": kept }),
            Err(e) => json!({ "error": e.to_string() }),
        }),
        "lock_acquisitions": lock_acquisitions,
        "members": nodes,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

/// Each client takes the simple lock once; returns how many got it in time
async fn contend_for_lock(config: &Config, clients: usize) -> anyhow::Result<usize> {
    let store = MemoryStore::new();
    let reaper = store.spawn_reaper(config.store.reaper_interval());
    let hold_for = config.store.lock_retry_backoff();

    let mut tasks = Vec::new();
    for _ in 0..clients {
        let client: Arc<dyn CoordinationStore> = Arc::new(store.connect_with(&config.store)?);
        let backoff = config.store.lock_retry_backoff();
        tasks.push(tokio::spawn(async move {
            let mut lock = DistributedLock::with_kind(client.clone(), "/sim/lock", LockKind::Simple)
                .retry_backoff(backoff);
            let acquired = lock.acquire(Some(Duration::from_secs(5))).await?;
            if acquired {
                tokio::time::sleep(hold_for).await;
                lock.release().await?;
            }
            client.close().await?;
            Ok::<_, Error>(acquired)
        }));
    }

    let mut acquired = 0;
    for task in tasks {
        if task.await?? {
            acquired += 1;
        }
    }
    reaper.abort();
    tracing::info!("{} of {} lock clients acquired the lock", acquired, clients);
    Ok(acquired)
}
