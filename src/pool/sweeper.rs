//! Background pool sweeper
//!
//! Expiry is enforced lazily on lookup; the sweeper only reclaims entries
//! nobody looks up again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::ConnectionPool;

/// Periodically reclaims expired pool entries
pub struct PoolSweeper {
    pool: Arc<ConnectionPool>,
    interval: Duration,
    running: Arc<RwLock<bool>>,
}

impl PoolSweeper {
    pub fn new(pool: Arc<ConnectionPool>, interval: Duration) -> Self {
        Self {
            pool,
            interval,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the sweep loop
    pub async fn start(self: Arc<Self>) {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("Pool sweeper already running");
                return;
            }
            *running = true;
        }

        info!("Starting pool sweeper (interval: {:?})", self.interval);

        let sweeper = Arc::clone(&self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweeper.interval);
            // first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;

                if !*sweeper.running.read().await {
                    info!("Pool sweeper stopped");
                    break;
                }

                let reclaimed = sweeper.pool.sweep();
                debug!(reclaimed, live = sweeper.pool.len(), "Pool sweep finished");
            }
        });
    }

    /// Stop the sweep loop after its current tick
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Stopping pool sweeper");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{IdentityKey, PoolSettings};

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_reclaims_idle_entries() {
        let pool = ConnectionPool::new(
            1,
            PoolSettings {
                idle_timeout: Some(Duration::from_secs(5)),
                ..PoolSettings::default()
            },
        );
        drop(pool.acquire(IdentityKey::anonymous(), false));
        assert_eq!(pool.len(), 1);

        let sweeper = Arc::new(PoolSweeper::new(Arc::clone(&pool), Duration::from_secs(10)));
        Arc::clone(&sweeper).start().await;
        assert!(sweeper.is_running().await);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(pool.len(), 0);

        sweeper.stop().await;
        assert!(!sweeper.is_running().await);
    }
}
