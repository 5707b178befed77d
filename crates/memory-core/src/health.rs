//! Service health aggregation (C6).
//!
//! Three dependencies are probed independently on a timer: the store, the
//! search index, and the embedder. Each starts `unhealthy` and flips to
//! `healthy` on its first successful probe. The aggregate flag is the
//! conjunction of the three; `/health` and startup both read it rather than
//! probing dependencies inline, so one slow dependency degrades readiness
//! without taking the request path down with it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

/// One monitored dependency's liveness flag.
#[derive(Debug)]
struct ComponentHealth {
    name: &'static str,
    healthy: AtomicBool,
}

impl ComponentHealth {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            healthy: AtomicBool::new(false),
        }
    }

    fn set(&self, healthy: bool) {
        let previous = self.healthy.swap(healthy, Ordering::SeqCst);
        if previous != healthy {
            if healthy {
                info!(component = self.name, "dependency became healthy");
            } else {
                warn!(component = self.name, "dependency became unhealthy");
            }
        }
    }

    fn get(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Aggregates store/index/embedder liveness into a single readiness flag.
pub struct HealthAggregator {
    store: ComponentHealth,
    search_index: ComponentHealth,
    embedder: ComponentHealth,
}

impl Default for HealthAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthAggregator {
    pub fn new() -> Self {
        Self {
            store: ComponentHealth::new("store"),
            search_index: ComponentHealth::new("search_index"),
            embedder: ComponentHealth::new("embedder"),
        }
    }

    pub fn report_store(&self, healthy: bool) {
        self.store.set(healthy);
    }

    pub fn report_search_index(&self, healthy: bool) {
        self.search_index.set(healthy);
    }

    pub fn report_embedder(&self, healthy: bool) {
        self.embedder.set(healthy);
    }

    /// Conjunction of all three component flags.
    pub fn is_healthy(&self) -> bool {
        self.store.get() && self.search_index.get() && self.embedder.get()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            healthy: self.is_healthy(),
            store_healthy: self.store.get(),
            search_index_healthy: self.search_index.get(),
            embedder_healthy: self.embedder.get(),
        }
    }

    /// Blocks until healthy or `deadline` elapses, polling every `poll_interval`.
    /// Per §4.6, the caller should set `deadline = max(2 * probe_interval, 60s)`.
    pub async fn wait_until_healthy(
        self: &Arc<Self>,
        poll_interval: Duration,
        deadline: Duration,
    ) -> bool {
        let start = tokio::time::Instant::now();
        loop {
            if self.is_healthy() {
                return true;
            }
            if start.elapsed() >= deadline {
                return false;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Point-in-time view of the aggregator, suitable for serializing into a
/// `/health` response body.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub store_healthy: bool,
    pub search_index_healthy: bool,
    pub embedder_healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unhealthy_and_requires_all_components() {
        let aggregator = HealthAggregator::new();
        assert!(!aggregator.is_healthy());

        aggregator.report_store(true);
        aggregator.report_search_index(true);
        assert!(!aggregator.is_healthy());

        aggregator.report_embedder(true);
        assert!(aggregator.is_healthy());
    }

    #[tokio::test]
    async fn wait_until_healthy_returns_once_all_components_report() {
        let aggregator = Arc::new(HealthAggregator::new());
        let waiter = aggregator.clone();
        let handle = tokio::spawn(async move {
            waiter
                .wait_until_healthy(Duration::from_millis(5), Duration::from_secs(1))
                .await
        });

        aggregator.report_store(true);
        aggregator.report_search_index(true);
        aggregator.report_embedder(true);

        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn wait_until_healthy_times_out_when_never_healthy() {
        let aggregator = Arc::new(HealthAggregator::new());
        let healthy = aggregator
            .wait_until_healthy(Duration::from_millis(5), Duration::from_millis(30))
            .await;
        assert!(!healthy);
    }
}
