//! Periodic eviction of stale sessions.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::gateway::GatewayHandle;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_SESSION_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweeperConfig {
    /// Time between sweeps. The first sweep runs one interval after start.
    pub interval: Duration,
    /// Sessions older than this are evicted regardless of activity.
    pub max_age: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
            max_age: DEFAULT_SESSION_MAX_AGE,
        }
    }
}

/// Background task that asks the gateway to sweep on a fixed cadence.
///
/// Sweeps travel through the gateway's command queue like any client
/// operation, so an eviction never interleaves with a join or a broadcast.
pub struct Sweeper {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Sweeper {
    pub fn start(gateway: GatewayHandle, config: SweeperConfig) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(gateway, config, cancel.clone()));
        tracing::info!(
            interval_secs = config.interval.as_secs(),
            max_age_secs = config.max_age.as_secs(),
            "session sweeper started"
        );
        Self { cancel, task }
    }

    /// Stop the sweeper and wait for its task to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(?e, "session sweeper task failed");
        }
        tracing::info!("session sweeper stopped");
    }
}

async fn run(gateway: GatewayHandle, config: SweeperConfig, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // interval() fires immediately; skip that tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match gateway.sweep(config.max_age).await {
                    Ok(removed) if removed.is_empty() => {
                        tracing::debug!("sweep found no stale sessions");
                    }
                    Ok(removed) => {
                        tracing::info!(count = removed.len(), sessions = ?removed, "swept stale sessions");
                    }
                    Err(e) => {
                        tracing::debug!(%e, "gateway gone, sweeper exiting");
                        break;
                    }
                }
            }
        }
    }
}
