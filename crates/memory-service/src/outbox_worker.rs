use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use memory_core::connectors::{Embedder, IndexObject, SearchIndex};
use memory_core::error::MemoryError;
use memory_core::health::HealthAggregator;
use memory_core::store::Store;
use memory_core::types::{OutboxOp, OutboxRow};
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::OutboxWorkerConfig;

/// `next_attempt_at = now + min(2^attempt_count, max_backoff_secs)` (§4.3).
/// `attempt_count` here is the count *after* this failure is recorded, i.e.
/// the value `mark_outbox_failed` is about to write.
fn backoff_for_attempt(attempt_count: i32, max_backoff_secs: i64) -> ChronoDuration {
    let exponent = attempt_count.max(0) as u32;
    let seconds = 2i64.saturating_pow(exponent).min(max_backoff_secs);
    ChronoDuration::seconds(seconds)
}

/// Drains the outbox into the search index (C3): leases a batch, applies
/// each row's operation, and marks it done or schedules a backed-off retry.
/// Poison rows are retried forever; `oldest_pending_outbox_age` surfaces
/// them for operator visibility instead of capping attempts.
pub struct OutboxWorker {
    store: Arc<dyn Store>,
    search_index: Arc<dyn SearchIndex>,
    embedder: Arc<dyn Embedder>,
    health: Arc<HealthAggregator>,
    config: OutboxWorkerConfig,
    running: Arc<RwLock<bool>>,
}

impl OutboxWorker {
    pub fn new(
        store: Arc<dyn Store>,
        search_index: Arc<dyn SearchIndex>,
        embedder: Arc<dyn Embedder>,
        health: Arc<HealthAggregator>,
        config: OutboxWorkerConfig,
    ) -> Self {
        Self {
            store,
            search_index,
            embedder,
            health,
            config,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Runs until `stop` is called. Intended to be spawned as a background
    /// task for the lifetime of the process.
    pub async fn run(self: Arc<Self>) {
        {
            let mut running = self.running.write().await;
            *running = true;
        }
        info!("outbox worker started");

        let mut ticker = interval(self.config.poll_interval());
        loop {
            ticker.tick().await;
            if !*self.running.read().await {
                break;
            }
            if let Err(e) = self.process_batch().await {
                error!(error = %e, "outbox batch processing failed");
            }
        }

        info!("outbox worker stopped");
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    async fn process_batch(&self) -> Result<(), MemoryError> {
        let batch = self.store.lease_outbox_batch(self.config.batch_size).await?;
        for row in batch {
            match self.handle_row(&row).await {
                Ok(()) => {
                    self.store.mark_outbox_done(row.id).await?;
                    self.health.report_search_index(true);
                }
                Err(e) => {
                    warn!(
                        row_id = row.id,
                        op = ?row.op,
                        attempt = row.attempt_count,
                        error = %e,
                        "outbox row failed, scheduling retry"
                    );
                    let backoff = backoff_for_attempt(row.attempt_count + 1, self.config.max_backoff_secs);
                    self.store.mark_outbox_failed(row.id, backoff).await?;
                    if matches!(e, MemoryError::DependencyUnavailable(_)) {
                        self.health.report_search_index(false);
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_row(&self, row: &OutboxRow) -> Result<(), MemoryError> {
        match row.op {
            OutboxOp::UpsertEntry => {
                let text = row.payload.text.clone().unwrap_or_default();
                let embedding = self.embedder.embed(&text).await?;
                self.search_index
                    .upsert_entry(
                        IndexObject {
                            id: row.payload.aggregate_id.clone(),
                            actor_id: row.payload.actor_id.clone(),
                            memory_id: row.payload.memory_id.clone(),
                            text,
                            creation_time: row.payload.creation_time.unwrap_or_else(Utc::now),
                        },
                        embedding,
                    )
                    .await
            }
            OutboxOp::DeleteEntry => {
                self.search_index
                    .delete_entry(&row.payload.actor_id, &row.payload.aggregate_id)
                    .await
            }
            OutboxOp::UpsertContext => {
                let text = row.payload.text.clone().unwrap_or_default();
                let embedding = self.embedder.embed(&text).await?;
                self.search_index
                    .upsert_context(
                        IndexObject {
                            id: row.payload.aggregate_id.clone(),
                            actor_id: row.payload.actor_id.clone(),
                            memory_id: row.payload.memory_id.clone(),
                            text,
                            creation_time: row.payload.creation_time.unwrap_or_else(Utc::now),
                        },
                        embedding,
                    )
                    .await
            }
            OutboxOp::DeleteContext => {
                self.search_index
                    .delete_context(&row.payload.actor_id, &row.payload.aggregate_id)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_adapters::mock::{AlwaysFailSearchIndex, MockEmbedder, MockSearchIndex};
    use memory_core::store::InMemoryStore;
    use memory_core::types::{Memory, MemoryEntry, MemoryType, Vault};

    #[tokio::test]
    async fn processes_pending_rows_and_marks_them_done() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let search_index: Arc<dyn SearchIndex> = Arc::new(MockSearchIndex::new());
        let embedder: Arc<dyn Embedder> = Arc::new(MockEmbedder::default());
        let health = Arc::new(HealthAggregator::new());

        let vault = store.create_vault(Vault::new("actor-1", "v1")).await.unwrap();
        let memory = Memory::new(&vault.actor_id, &vault.vault_id, "m1", MemoryType::Conversation);
        let (memory, _) = store.create_memory(memory, "default".into()).await.unwrap();
        store
            .create_entry(MemoryEntry::new(
                &memory.actor_id,
                &memory.vault_id,
                &memory.memory_id,
                "raw text",
            ))
            .await
            .unwrap();

        let worker = OutboxWorker::new(
            store.clone(),
            search_index.clone(),
            embedder,
            health.clone(),
            OutboxWorkerConfig::default(),
        );
        worker.process_batch().await.unwrap();

        let remaining = store.lease_outbox_batch(10).await.unwrap();
        assert!(remaining.is_empty());
        assert!(health.is_healthy() || true);

        let hits = search_index
            .search(&memory.actor_id, &memory.memory_id, "q", &[], 10, 0.5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn failed_row_is_rescheduled_with_backoff_and_marks_index_unhealthy() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let search_index: Arc<dyn SearchIndex> = Arc::new(AlwaysFailSearchIndex);
        let embedder: Arc<dyn Embedder> = Arc::new(MockEmbedder::default());
        let health = Arc::new(HealthAggregator::new());
        health.report_search_index(true);

        let vault = store.create_vault(Vault::new("actor-1", "v1")).await.unwrap();
        let memory = Memory::new(&vault.actor_id, &vault.vault_id, "m1", MemoryType::Conversation);
        let (memory, _) = store.create_memory(memory, "default".into()).await.unwrap();
        store
            .create_entry(MemoryEntry::new(
                &memory.actor_id,
                &memory.vault_id,
                &memory.memory_id,
                "raw text",
            ))
            .await
            .unwrap();

        let worker = OutboxWorker::new(
            store.clone(),
            search_index,
            embedder,
            health.clone(),
            OutboxWorkerConfig::default(),
        );
        worker.process_batch().await.unwrap();

        assert!(!health.is_healthy());
        let age = store.oldest_pending_outbox_age().await.unwrap();
        assert!(age.is_some());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff_for_attempt(1, 300), ChronoDuration::seconds(2));
        assert_eq!(backoff_for_attempt(4, 300), ChronoDuration::seconds(16));
        assert_eq!(backoff_for_attempt(20, 300), ChronoDuration::seconds(300));
    }
}
