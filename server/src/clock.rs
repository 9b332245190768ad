//! Broadcast clock driving every sender's snapshot cadence.

use log::{debug, info};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Publishes a tick counter every `period` until shutdown.
/// Ticks published while no sender is subscribed are dropped.
pub async fn run_broadcast_clock(
    ticks: broadcast::Sender<u64>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tick: u64 = 0;

    info!("Broadcast clock started ({:?} period)", period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if ticks.send(tick).is_err() && tick % 100 == 0 {
                    debug!("Broadcast tick {} had no subscribers", tick);
                }
                tick = tick.wrapping_add(1);
            }
        }
    }
    info!("Broadcast clock stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_reach_every_subscriber() {
        let (ticks, _) = broadcast::channel(16);
        let mut first = ticks.subscribe();
        let mut second = ticks.subscribe();
        let shutdown = CancellationToken::new();

        let clock = tokio::spawn(run_broadcast_clock(
            ticks,
            Duration::from_millis(100),
            shutdown.clone(),
        ));

        assert_eq!(first.recv().await.unwrap(), 0);
        assert_eq!(first.recv().await.unwrap(), 1);
        assert_eq!(second.recv().await.unwrap(), 0);

        shutdown.cancel();
        clock.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_without_subscribers() {
        let (ticks, _) = broadcast::channel::<u64>(4);
        let shutdown = CancellationToken::new();

        let clock = tokio::spawn(run_broadcast_clock(
            ticks.clone(),
            Duration::from_millis(10),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(55)).await;

        let mut late = ticks.subscribe();
        let tick = late.recv().await.unwrap();
        assert!(tick >= 5);

        shutdown.cancel();
        clock.await.unwrap();
    }
}
