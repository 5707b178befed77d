use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use memory_core::connectors::{Embedder, IndexObject, SearchIndex};
use memory_core::error::MemoryError;
use memory_core::types::SearchHit;

#[derive(Debug, Clone)]
struct StoredObject {
    object: IndexObject,
    embedding: Vec<f32>,
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Deterministic in-memory `SearchIndex` for tests and local development.
/// Scores by cosine similarity between the query embedding and whatever was
/// last upserted; no network, no external service.
#[derive(Default)]
pub struct MockSearchIndex {
    entries: Mutex<HashMap<String, StoredObject>>,
    contexts: Mutex<HashMap<String, StoredObject>>,
}

impl MockSearchIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SearchIndex for MockSearchIndex {
    async fn upsert_entry(&self, object: IndexObject, embedding: Vec<f32>) -> Result<(), MemoryError> {
        self.entries
            .lock()
            .unwrap()
            .insert(object.id.clone(), StoredObject { object, embedding });
        Ok(())
    }

    async fn delete_entry(&self, _actor_id: &str, entry_id: &str) -> Result<(), MemoryError> {
        self.entries.lock().unwrap().remove(entry_id);
        Ok(())
    }

    async fn upsert_context(&self, object: IndexObject, embedding: Vec<f32>) -> Result<(), MemoryError> {
        self.contexts
            .lock()
            .unwrap()
            .insert(object.id.clone(), StoredObject { object, embedding });
        Ok(())
    }

    async fn delete_context(&self, _actor_id: &str, context_id: &str) -> Result<(), MemoryError> {
        self.contexts.lock().unwrap().remove(context_id);
        Ok(())
    }

    async fn delete_vault(&self, actor_id: &str, _vault_id: &str) -> Result<(), MemoryError> {
        self.entries.lock().unwrap().retain(|_, v| v.object.actor_id != actor_id);
        self.contexts.lock().unwrap().retain(|_, v| v.object.actor_id != actor_id);
        Ok(())
    }

    async fn delete_memory(&self, actor_id: &str, memory_id: &str) -> Result<(), MemoryError> {
        self.entries
            .lock()
            .unwrap()
            .retain(|_, v| !(v.object.actor_id == actor_id && v.object.memory_id == memory_id));
        self.contexts
            .lock()
            .unwrap()
            .retain(|_, v| !(v.object.actor_id == actor_id && v.object.memory_id == memory_id));
        Ok(())
    }

    async fn search(
        &self,
        actor_id: &str,
        memory_id: &str,
        _query: &str,
        query_vector: &[f32],
        top_k: usize,
        _alpha: f32,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        let entries = self.entries.lock().unwrap();
        let mut hits: Vec<SearchHit> = entries
            .values()
            .filter(|e| e.object.actor_id == actor_id && e.object.memory_id == memory_id)
            .map(|e| SearchHit {
                entry_id: e.object.id.clone(),
                actor_id: e.object.actor_id.clone(),
                memory_id: e.object.memory_id.clone(),
                summary: None,
                raw_entry: e.object.text.clone(),
                score: cosine_similarity(query_vector, &e.embedding),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn latest_context(
        &self,
        actor_id: &str,
        memory_id: &str,
    ) -> Result<Option<(String, DateTime<Utc>)>, MemoryError> {
        let contexts = self.contexts.lock().unwrap();
        Ok(contexts
            .values()
            .filter(|c| c.object.actor_id == actor_id && c.object.memory_id == memory_id)
            .max_by_key(|c| c.object.creation_time)
            .map(|c| (c.object.text.clone(), c.object.creation_time)))
    }

    async fn best_context(
        &self,
        actor_id: &str,
        memory_id: &str,
        _query: &str,
        query_vector: &[f32],
        _alpha: f32,
    ) -> Result<Option<(String, DateTime<Utc>, f32)>, MemoryError> {
        let contexts = self.contexts.lock().unwrap();
        Ok(contexts
            .values()
            .filter(|c| c.object.actor_id == actor_id && c.object.memory_id == memory_id)
            .map(|c| (c, cosine_similarity(query_vector, &c.embedding)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
            .map(|(c, score)| (c.object.text.clone(), c.object.creation_time, score)))
    }

    async fn ping(&self) -> Result<(), MemoryError> {
        Ok(())
    }
}

/// Deterministic embedder: hashes the text into a fixed-size vector. No
/// network calls, suitable for tests and local dev where no real embedding
/// provider is configured.
pub struct MockEmbedder {
    dimensions: usize,
}

impl MockEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(32)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut vector = Vec::with_capacity(self.dimensions);
        for i in 0..self.dimensions {
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            i.hash(&mut hasher);
            let bucket = hasher.finish();
            vector.push(((bucket % 1000) as f32 / 1000.0) - 0.5);
        }
        Ok(vector)
    }
}

fn unavailable(dependency: &str) -> MemoryError {
    MemoryError::DependencyUnavailable(format!("{dependency} unreachable"))
}

/// Test double that fails every call, mirroring a dependency that is
/// reachable at the network level but rejects every request.
#[derive(Default)]
pub struct AlwaysFailSearchIndex;

#[async_trait]
impl SearchIndex for AlwaysFailSearchIndex {
    async fn upsert_entry(&self, _object: IndexObject, _embedding: Vec<f32>) -> Result<(), MemoryError> {
        Err(unavailable("search index"))
    }

    async fn delete_entry(&self, _actor_id: &str, _entry_id: &str) -> Result<(), MemoryError> {
        Err(unavailable("search index"))
    }

    async fn upsert_context(&self, _object: IndexObject, _embedding: Vec<f32>) -> Result<(), MemoryError> {
        Err(unavailable("search index"))
    }

    async fn delete_context(&self, _actor_id: &str, _context_id: &str) -> Result<(), MemoryError> {
        Err(unavailable("search index"))
    }

    async fn delete_vault(&self, _actor_id: &str, _vault_id: &str) -> Result<(), MemoryError> {
        Err(unavailable("search index"))
    }

    async fn delete_memory(&self, _actor_id: &str, _memory_id: &str) -> Result<(), MemoryError> {
        Err(unavailable("search index"))
    }

    async fn search(
        &self,
        _actor_id: &str,
        _memory_id: &str,
        _query: &str,
        _query_vector: &[f32],
        _top_k: usize,
        _alpha: f32,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        Err(unavailable("search index"))
    }

    async fn latest_context(
        &self,
        _actor_id: &str,
        _memory_id: &str,
    ) -> Result<Option<(String, DateTime<Utc>)>, MemoryError> {
        Err(unavailable("search index"))
    }

    async fn best_context(
        &self,
        _actor_id: &str,
        _memory_id: &str,
        _query: &str,
        _query_vector: &[f32],
        _alpha: f32,
    ) -> Result<Option<(String, DateTime<Utc>, f32)>, MemoryError> {
        Err(unavailable("search index"))
    }

    async fn ping(&self) -> Result<(), MemoryError> {
        Err(unavailable("search index"))
    }
}

/// Test double embedder that always fails, for exercising health/retry paths.
#[derive(Default)]
pub struct AlwaysFailEmbedder;

#[async_trait]
impl Embedder for AlwaysFailEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, MemoryError> {
        Err(unavailable("embedder"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn mock_search_index_round_trips_entries() {
        let index = MockSearchIndex::new();
        index
            .upsert_entry(
                IndexObject {
                    id: "entry-1".to_string(),
                    actor_id: "actor-1".to_string(),
                    memory_id: "memory-1".to_string(),
                    text: "hello world".to_string(),
                    creation_time: Utc::now(),
                },
                vec![1.0, 0.0, 0.0],
            )
            .await
            .unwrap();

        let hits = index
            .search("actor-1", "memory-1", "hello", &[1.0, 0.0, 0.0], 10, 0.5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry_id, "entry-1");
        assert!(hits[0].score > 0.99);

        index.delete_entry("actor-1", "entry-1").await.unwrap();
        let hits = index
            .search("actor-1", "memory-1", "hello", &[1.0, 0.0, 0.0], 10, 0.5)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn mock_embedder_is_deterministic() {
        let embedder = MockEmbedder::default();
        let a = embedder.embed("hello").await.unwrap();
        let b = embedder.embed("hello").await.unwrap();
        assert_eq!(a, b);
        let c = embedder.embed("goodbye").await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn always_fail_search_index_rejects_every_call() {
        let index = AlwaysFailSearchIndex;
        assert!(index.ping().await.is_err());
        assert!(index
            .search("a", "m", "q", &[], 10, 0.5)
            .await
            .is_err());
    }
}
