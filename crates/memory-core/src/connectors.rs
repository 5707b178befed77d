use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MemoryError;
use crate::types::SearchHit;

/// A single class of object the index stores: an entry's summary/raw text,
/// or a context snapshot's document, scoped to one actor/memory.
#[derive(Debug, Clone)]
pub struct IndexObject {
    pub id: String,
    pub actor_id: String,
    pub memory_id: String,
    pub text: String,
    pub creation_time: DateTime<Utc>,
}

/// Pluggable hybrid search index (C4). Implementations must make
/// upsert/delete idempotent by id (I6) and provision per-actor tenants
/// lazily.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn upsert_entry(
        &self,
        object: IndexObject,
        embedding: Vec<f32>,
    ) -> Result<(), MemoryError>;
    async fn delete_entry(&self, actor_id: &str, entry_id: &str) -> Result<(), MemoryError>;

    async fn upsert_context(
        &self,
        object: IndexObject,
        embedding: Vec<f32>,
    ) -> Result<(), MemoryError>;
    async fn delete_context(&self, actor_id: &str, context_id: &str) -> Result<(), MemoryError>;

    /// Best-effort; may be a no-op when the index has no vault-scoped object.
    async fn delete_vault(&self, actor_id: &str, vault_id: &str) -> Result<(), MemoryError>;

    /// Best-effort; may be a no-op when the index has no memory-scoped object.
    /// Callers still enumerate and delete a memory's entries/contexts
    /// individually (C5), the same way `delete_vault` is paired with
    /// per-child deletes rather than relied on alone.
    async fn delete_memory(&self, actor_id: &str, memory_id: &str) -> Result<(), MemoryError>;

    async fn search(
        &self,
        actor_id: &str,
        memory_id: &str,
        query: &str,
        query_vector: &[f32],
        top_k: usize,
        alpha: f32,
    ) -> Result<Vec<SearchHit>, MemoryError>;

    async fn latest_context(
        &self,
        actor_id: &str,
        memory_id: &str,
    ) -> Result<Option<(String, DateTime<Utc>)>, MemoryError>;

    async fn best_context(
        &self,
        actor_id: &str,
        memory_id: &str,
        query: &str,
        query_vector: &[f32],
        alpha: f32,
    ) -> Result<Option<(String, DateTime<Utc>, f32)>, MemoryError>;

    /// Cheap liveness probe used by the health aggregator.
    async fn ping(&self) -> Result<(), MemoryError>;
}

/// Pluggable embedding provider (C7): pure text-to-vector capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;
}
