//! Background pruners.
//!
//! Two cooperating loops: stale runtime workers every second, expired
//! tasks every minute. Both hold no locks shared with the dispatcher and
//! exit when the shutdown signal flips.

use chrono::{Duration, Utc};
use onlyboxes_db::Database;
use onlyboxes_protocol::defaults;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub fn spawn_pruners(
    db: Database,
    offline_ttl: Duration,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(worker_prune_loop(db.clone(), offline_ttl, shutdown.clone())),
        tokio::spawn(task_prune_loop(db, shutdown)),
    ]
}

/// Delete non-provisioned nodes whose heartbeat lapsed. Provisioned
/// nodes never die here; they just read as offline.
async fn worker_prune_loop(db: Database, offline_ttl: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
        defaults::WORKER_PRUNE_INTERVAL_SECS,
    ));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cutoff = Utc::now() - offline_ttl;
                match db.workers().prune_offline_runtime(cutoff).await {
                    Ok(0) => {}
                    Ok(pruned) => debug!(pruned, "Pruned offline runtime workers"),
                    Err(e) => warn!(error = %e, "Worker prune failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Delete terminal tasks past their retention window.
async fn task_prune_loop(db: Database, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
        defaults::TASK_PRUNE_INTERVAL_SECS,
    ));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match db.tasks().prune_expired(Utc::now()).await {
                    Ok(0) => {}
                    Ok(pruned) => debug!(pruned, "Pruned expired tasks"),
                    Err(e) => warn!(error = %e, "Task prune failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
