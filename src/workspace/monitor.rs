//! Background eviction of sessions whose heartbeat went stale

use super::manager::WorkspaceManager;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct LivenessMonitor {
    manager: Arc<WorkspaceManager>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(manager: Arc<WorkspaceManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Start sweeping every `interval` until `token` is cancelled
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            info!(
                "Liveness monitor started (interval {:?}, timeout {:?})",
                self.interval,
                self.manager.heartbeat_timeout()
            );
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let pending = self.sweep_at(self.manager.now()).await;
                        if !pending.is_empty() {
                            tokio::spawn(reap(pending));
                        }
                    }
                }
            }
            info!("Liveness monitor stopped");
        })
    }

    /// Run one sweep and wait for its teardowns; returns the evicted ids
    pub async fn sweep_once(&self) -> Vec<String> {
        self.sweep_once_at(self.manager.now()).await
    }

    pub async fn sweep_once_at(&self, now: DateTime<Utc>) -> Vec<String> {
        reap(self.sweep_at(now).await).await
    }

    /// Spawn one teardown task per expired session
    async fn sweep_at(&self, now: DateTime<Utc>) -> Vec<(String, JoinHandle<bool>)> {
        let expired = self.manager.expired(now).await;
        if expired.is_empty() {
            return Vec::new();
        }

        debug!("Evicting {} stale sessions", expired.len());
        expired
            .into_iter()
            .map(|session_id| {
                let manager = Arc::clone(&self.manager);
                let id = session_id.clone();
                let handle = tokio::spawn(async move { manager.teardown(&id).await });
                (session_id, handle)
            })
            .collect()
    }
}

/// Await teardown tasks, logging any that panicked
async fn reap(pending: Vec<(String, JoinHandle<bool>)>) -> Vec<String> {
    let mut evicted = Vec::with_capacity(pending.len());
    for (session_id, handle) in pending {
        match handle.await {
            Ok(_) => {
                info!("Session {} expired", session_id);
                evicted.push(session_id);
            }
            Err(e) => error!("Teardown task for session {} failed: {}", session_id, e),
        }
    }
    evicted
}
