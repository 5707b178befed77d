use std::sync::Arc;

use crate::connectors::{Embedder, SearchIndex};
use crate::error::MemoryError;
use crate::store::Store;
use crate::types::{
    CorrectEntryRequest, CreateEntryRequest, ListEntriesFilter, Memory, MemoryContext, MemoryEntry,
    MemoryType, SearchRequest, SearchResult, Vault, DEFAULT_SEARCH_TOP_K,
};
use crate::validation::{validate_context_document, validate_json_object};

/// Knobs that are fixed per deployment rather than per-request (§10.2).
#[derive(Debug, Clone)]
pub struct MemoryServiceConfig {
    pub default_context_document: String,
    pub max_context_chars: usize,
    pub hybrid_alpha: f32,
}

impl Default for MemoryServiceConfig {
    fn default() -> Self {
        Self {
            default_context_document: "New memory created. No context yet.".to_string(),
            max_context_chars: 200_000,
            hybrid_alpha: 0.5,
        }
    }
}

/// Use-case orchestration layer (C5): the only component allowed to call
/// both the store and the collaborator adapters. HTTP handlers and the
/// outbox worker both sit on top of this, never touching `Store`/
/// `SearchIndex`/`Embedder` directly.
#[derive(Clone)]
pub struct MemoryService {
    store: Arc<dyn Store>,
    search_index: Arc<dyn SearchIndex>,
    embedder: Arc<dyn Embedder>,
    config: MemoryServiceConfig,
}

impl MemoryService {
    pub fn new(
        store: Arc<dyn Store>,
        search_index: Arc<dyn SearchIndex>,
        embedder: Arc<dyn Embedder>,
        config: MemoryServiceConfig,
    ) -> Self {
        Self {
            store,
            search_index,
            embedder,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn search_index(&self) -> &Arc<dyn SearchIndex> {
        &self.search_index
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub async fn create_vault(
        &self,
        actor_id: &str,
        title: String,
    ) -> Result<Vault, MemoryError> {
        self.store.create_vault(Vault::new(actor_id, title)).await
    }

    pub async fn list_vaults(&self, actor_id: &str) -> Result<Vec<Vault>, MemoryError> {
        self.store.list_vaults(actor_id).await
    }

    pub async fn get_vault(&self, actor_id: &str, vault_id: &str) -> Result<Vault, MemoryError> {
        self.store.get_vault(actor_id, vault_id).await
    }

    /// Deletes index objects for every entry/context the vault owns before
    /// deleting the vault itself (§4.5): if the index is unreachable the
    /// store is left untouched and the caller can retry.
    pub async fn delete_vault(&self, actor_id: &str, vault_id: &str) -> Result<(), MemoryError> {
        let children = self
            .store
            .enumerate_vault_children(actor_id, vault_id)
            .await?;

        for entry in &children.entries {
            self.search_index
                .delete_entry(actor_id, &entry.entry_id)
                .await?;
        }
        for context in &children.contexts {
            self.search_index
                .delete_context(actor_id, &context.context_id)
                .await?;
        }
        self.search_index.delete_vault(actor_id, vault_id).await?;

        self.store.delete_vault(actor_id, vault_id).await
    }

    /// Creates the memory with a non-empty default context atomically (I8).
    pub async fn create_memory(
        &self,
        actor_id: &str,
        vault_id: &str,
        title: String,
        memory_type: MemoryType,
    ) -> Result<(Memory, MemoryContext), MemoryError> {
        let memory = Memory::new(actor_id, vault_id, title, memory_type);
        self.store
            .create_memory(memory, self.config.default_context_document.clone())
            .await
    }

    pub async fn list_memories(
        &self,
        actor_id: &str,
        vault_id: &str,
    ) -> Result<Vec<Memory>, MemoryError> {
        self.store.list_memories(actor_id, vault_id).await
    }

    pub async fn get_memory(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
    ) -> Result<Memory, MemoryError> {
        self.store.get_memory(actor_id, vault_id, memory_id).await
    }

    pub async fn delete_memory(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
    ) -> Result<(), MemoryError> {
        let children = self
            .store
            .enumerate_memory_children(actor_id, vault_id, memory_id)
            .await?;

        for entry in &children.entries {
            self.search_index
                .delete_entry(actor_id, &entry.entry_id)
                .await?;
        }
        for context in &children.contexts {
            self.search_index
                .delete_context(actor_id, &context.context_id)
                .await?;
        }
        self.search_index.delete_memory(actor_id, memory_id).await?;

        self.store
            .delete_memory(actor_id, vault_id, memory_id)
            .await
    }

    pub async fn create_entry(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        request: CreateEntryRequest,
    ) -> Result<MemoryEntry, MemoryError> {
        validate_json_object("metadata", &request.metadata)?;
        validate_json_object("tags", &request.tags)?;

        let mut entry = MemoryEntry::new(actor_id, vault_id, memory_id, request.raw_entry);
        entry.summary = request.summary;
        entry.metadata = request.metadata;
        entry.tags = request.tags;
        entry.expiration_time = request.expiration_time;
        self.store.create_entry(entry).await
    }

    pub async fn list_entries(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        filter: ListEntriesFilter,
    ) -> Result<Vec<MemoryEntry>, MemoryError> {
        if filter.before.is_some() && filter.after.is_some() {
            return Err(MemoryError::Validation(
                "before and after filters are mutually exclusive".to_string(),
            ));
        }
        self.store
            .list_entries(actor_id, vault_id, memory_id, filter)
            .await
    }

    pub async fn get_entry(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        entry_id: &str,
    ) -> Result<MemoryEntry, MemoryError> {
        self.store
            .get_entry(actor_id, vault_id, memory_id, entry_id)
            .await
    }

    pub async fn update_entry_tags(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        entry_id: &str,
        tags: serde_json::Value,
    ) -> Result<MemoryEntry, MemoryError> {
        validate_json_object("tags", &tags)?;
        self.store
            .update_entry_tags(actor_id, vault_id, memory_id, entry_id, tags)
            .await
    }

    pub async fn update_entry_summary(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        entry_id: &str,
        summary: String,
    ) -> Result<MemoryEntry, MemoryError> {
        self.store
            .update_entry_summary(actor_id, vault_id, memory_id, entry_id, summary)
            .await
    }

    pub async fn correct_entry(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        entry_id: &str,
        request: CorrectEntryRequest,
    ) -> Result<(MemoryEntry, MemoryEntry), MemoryError> {
        let mut corrected = MemoryEntry::new(actor_id, vault_id, memory_id, request.raw_entry);
        corrected.summary = request.summary;
        self.store
            .correct_entry(
                actor_id,
                vault_id,
                memory_id,
                entry_id,
                corrected,
                request.reason,
            )
            .await
    }

    pub async fn delete_entry(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        entry_id: &str,
    ) -> Result<(), MemoryError> {
        self.search_index.delete_entry(actor_id, entry_id).await?;
        self.store
            .delete_entry(actor_id, vault_id, memory_id, entry_id)
            .await
    }

    /// Validates the document (I9) before writing it.
    pub async fn put_context(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        document: String,
    ) -> Result<MemoryContext, MemoryError> {
        validate_context_document(&document, self.config.max_context_chars)?;
        self.store
            .put_context(MemoryContext::new(actor_id, vault_id, memory_id, document))
            .await
    }

    pub async fn get_latest_context(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
    ) -> Result<MemoryContext, MemoryError> {
        self.store
            .latest_context(actor_id, vault_id, memory_id)
            .await
    }

    pub async fn delete_context(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        context_id: &str,
    ) -> Result<(), MemoryError> {
        self.search_index
            .delete_context(actor_id, context_id)
            .await?;
        self.store
            .delete_context(actor_id, vault_id, memory_id, context_id)
            .await
    }

    /// Embeds the query, runs the hybrid search, and attaches the memory's
    /// latest/best context to the response.
    pub async fn search(
        &self,
        actor_id: &str,
        memory_id: &str,
        request: SearchRequest,
    ) -> Result<SearchResult, MemoryError> {
        let top_k = request.top_k.unwrap_or(DEFAULT_SEARCH_TOP_K);
        let query_vector = self.embedder.embed(&request.query).await?;

        let entries = self
            .search_index
            .search(
                actor_id,
                memory_id,
                &request.query,
                &query_vector,
                top_k,
                self.config.hybrid_alpha,
            )
            .await?;

        let (latest_context, latest_context_timestamp) = match self
            .search_index
            .latest_context(actor_id, memory_id)
            .await?
        {
            Some((doc, ts)) => (Some(doc), Some(ts)),
            None => (None, None),
        };

        let (best_context, best_context_timestamp, best_context_score) = match self
            .search_index
            .best_context(
                actor_id,
                memory_id,
                &request.query,
                &query_vector,
                self.config.hybrid_alpha,
            )
            .await?
        {
            Some((doc, ts, score)) => (Some(doc), Some(ts), Some(score)),
            None => (None, None, None),
        };

        Ok(SearchResult {
            count: entries.len(),
            entries,
            latest_context,
            latest_context_timestamp,
            best_context,
            best_context_timestamp,
            best_context_score,
        })
    }
}
