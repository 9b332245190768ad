//! Health monitor: probes every in-use worker on a fixed interval and
//! reclaims the ones that stopped answering.

use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::worker::WorkerStatus;
use crate::worker_pool::WorkerPool;

/// Startup check that the pool holds exactly `expected` idle workers
pub fn verify_pool(pool: &WorkerPool, expected: usize) -> Result<()> {
    let actual = pool.available_count();
    if actual != expected || pool.capacity() != expected {
        return Err(Error::PoolInitialization { actual, expected });
    }
    Ok(())
}

pub async fn health_check_and_revive(
    pool: Arc<WorkerPool>,
    check_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let revived = check_workers(&pool, check_interval).await;
                if revived > 0 {
                    info!("Health check revived {} workers", revived);
                }
            }
        }
    }
}

/// Probes all in-use workers concurrently and revives the unhealthy ones.
/// Returns the number of revived workers.
pub async fn check_workers(pool: &WorkerPool, window: Duration) -> usize {
    let mut checks = JoinSet::new();

    for worker in pool.in_use_workers() {
        checks.spawn(async move {
            let generation = worker.generation();
            let healthy = worker.status() != WorkerStatus::Terminated
                && worker.check_liveness(window).await;
            (worker.id(), generation, healthy)
        });
    }

    let mut revived = 0;
    while let Some(joined) = checks.join_next().await {
        match joined {
            Ok((id, generation, false)) => {
                warn!("Worker {} failed its health check", id);
                if pool.revive(id, generation) {
                    revived += 1;
                }
            }
            Ok(_) => {}
            Err(e) => error!("Health check task failed: {}", e),
        }
    }
    revived
}
