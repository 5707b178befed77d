use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::MemoryError;
use crate::types::{
    ListEntriesFilter, Memory, MemoryContext, MemoryEntry, OutboxOp, OutboxPayload, OutboxRow,
    OutboxStatus, Vault,
};

/// Reference to an entry owned by a memory, used when enumerating a vault or
/// memory's children before a cascading delete (§4.5).
#[derive(Debug, Clone)]
pub struct EntryRef {
    pub memory_id: String,
    pub entry_id: String,
}

/// Reference to a context snapshot owned by a memory.
#[derive(Debug, Clone)]
pub struct ContextRef {
    pub memory_id: String,
    pub context_id: String,
}

/// Entry and context ids belonging to a vault or memory, gathered before a
/// cascading delete so the caller can propagate deletes to the search index.
#[derive(Debug, Clone, Default)]
pub struct CascadeChildren {
    pub entries: Vec<EntryRef>,
    pub contexts: Vec<ContextRef>,
}

/// Durable persistence backend for vaults, memories, entries, contexts, and
/// the outbox (C1). Every mutating method that must be reflected in the
/// search index writes exactly one matching outbox row in the same
/// transaction (I5).
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_vault(&self, vault: Vault) -> Result<Vault, MemoryError>;
    async fn list_vaults(&self, actor_id: &str) -> Result<Vec<Vault>, MemoryError>;
    async fn get_vault(&self, actor_id: &str, vault_id: &str) -> Result<Vault, MemoryError>;
    async fn get_vault_by_title(&self, actor_id: &str, title: &str) -> Result<Vault, MemoryError>;
    /// Enumerate every entry/context owned transitively by the vault, without deleting anything.
    async fn enumerate_vault_children(
        &self,
        actor_id: &str,
        vault_id: &str,
    ) -> Result<CascadeChildren, MemoryError>;
    /// Cascading hard delete of the vault and everything it owns; emits one
    /// `delete_entry`/`delete_context` outbox row per deleted child (I7).
    async fn delete_vault(&self, actor_id: &str, vault_id: &str) -> Result<(), MemoryError>;

    /// Creates the memory and its default context snapshot atomically (I8),
    /// emitting one `upsert_context` outbox row.
    async fn create_memory(
        &self,
        memory: Memory,
        default_context_document: String,
    ) -> Result<(Memory, MemoryContext), MemoryError>;
    async fn get_memory(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
    ) -> Result<Memory, MemoryError>;
    async fn list_memories(&self, actor_id: &str, vault_id: &str)
        -> Result<Vec<Memory>, MemoryError>;
    async fn get_memory_by_title(
        &self,
        actor_id: &str,
        vault_id: &str,
        title: &str,
    ) -> Result<Memory, MemoryError>;
    async fn enumerate_memory_children(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
    ) -> Result<CascadeChildren, MemoryError>;
    async fn delete_memory(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
    ) -> Result<(), MemoryError>;

    /// Inserts the entry and emits an `upsert_entry` outbox row atomically.
    async fn create_entry(&self, entry: MemoryEntry) -> Result<MemoryEntry, MemoryError>;
    async fn list_entries(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        filter: ListEntriesFilter,
    ) -> Result<Vec<MemoryEntry>, MemoryError>;
    async fn get_entry(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        entry_id: &str,
    ) -> Result<MemoryEntry, MemoryError>;
    /// Refuses to modify a corrected entry (I3).
    async fn update_entry_tags(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        entry_id: &str,
        tags: serde_json::Value,
    ) -> Result<MemoryEntry, MemoryError>;
    async fn update_entry_summary(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        entry_id: &str,
        summary: String,
    ) -> Result<MemoryEntry, MemoryError>;
    /// Inserts `corrected` as a new entry and sets the original's correction
    /// pointers, atomically, emitting one `upsert_entry` outbox row for the
    /// new entry (I2, I3, I4). Fails with `ImmutabilityViolation` if the
    /// original is already corrected.
    async fn correct_entry(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        original_entry_id: &str,
        corrected: MemoryEntry,
        reason: String,
    ) -> Result<(MemoryEntry, MemoryEntry), MemoryError>;
    async fn delete_entry(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        entry_id: &str,
    ) -> Result<(), MemoryError>;

    /// Inserts the context and emits an `upsert_context` outbox row.
    async fn put_context(&self, context: MemoryContext) -> Result<MemoryContext, MemoryError>;
    async fn latest_context(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
    ) -> Result<MemoryContext, MemoryError>;
    async fn delete_context(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        context_id: &str,
    ) -> Result<(), MemoryError>;

    /// Leases up to `batch_size` pending, ready outbox rows for processing.
    /// Implementations must guarantee at-most-one concurrent lease per row.
    async fn lease_outbox_batch(&self, batch_size: usize) -> Result<Vec<OutboxRow>, MemoryError>;
    async fn mark_outbox_done(&self, id: i64) -> Result<(), MemoryError>;
    async fn mark_outbox_failed(&self, id: i64, backoff: Duration) -> Result<(), MemoryError>;
    /// Oldest pending outbox row's age, used for operator visibility (§10.5).
    async fn oldest_pending_outbox_age(&self) -> Result<Option<Duration>, MemoryError>;

    /// Trivial liveness probe (`SELECT 1` for a relational backend).
    async fn ping(&self) -> Result<(), MemoryError>;
}

struct InMemoryState {
    vaults: BTreeMap<(String, String), Vault>,
    memories: BTreeMap<(String, String, String), Memory>,
    entries: BTreeMap<(String, String, String, String), MemoryEntry>,
    contexts: BTreeMap<(String, String, String, String), MemoryContext>,
    outbox: Vec<OutboxRow>,
    next_outbox_id: i64,
    clock_tick: DateTime<Utc>,
}

impl InMemoryState {
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        self.clock_tick = if now > self.clock_tick {
            now
        } else {
            self.clock_tick + Duration::microseconds(1)
        };
        self.clock_tick
    }

    fn push_outbox(&mut self, op: OutboxOp, aggregate_id: String, payload: OutboxPayload) {
        let now = Utc::now();
        self.next_outbox_id += 1;
        self.outbox.push(OutboxRow {
            id: self.next_outbox_id,
            aggregate_id,
            op,
            payload,
            status: OutboxStatus::Pending,
            attempt_count: 0,
            next_attempt_at: now,
            created_at: now,
            updated_at: now,
        });
    }
}

/// Single-process in-memory `Store`, used for tests and single-node/dev
/// deployments. A single mutex serializes all mutation; correctness over
/// throughput.
pub struct InMemoryStore {
    state: Mutex<InMemoryState>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InMemoryState {
                vaults: BTreeMap::new(),
                memories: BTreeMap::new(),
                entries: BTreeMap::new(),
                contexts: BTreeMap::new(),
                outbox: Vec::new(),
                next_outbox_id: 0,
                clock_tick: Utc::now(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryState> {
        self.state.lock().expect("in-memory store mutex poisoned")
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_vault(&self, vault: Vault) -> Result<Vault, MemoryError> {
        let mut state = self.lock();
        let key = (vault.actor_id.clone(), vault.vault_id.clone());
        if state.vaults.contains_key(&key) {
            return Err(MemoryError::Conflict(format!(
                "vault '{}' already exists",
                vault.vault_id
            )));
        }
        let title_taken = state
            .vaults
            .values()
            .any(|v| v.actor_id == vault.actor_id && v.title == vault.title);
        if title_taken {
            return Err(MemoryError::conflict_title("vault", vault.title.clone()));
        }
        state.vaults.insert(key, vault.clone());
        Ok(vault)
    }

    async fn list_vaults(&self, actor_id: &str) -> Result<Vec<Vault>, MemoryError> {
        let state = self.lock();
        Ok(state
            .vaults
            .values()
            .filter(|v| v.actor_id == actor_id)
            .cloned()
            .collect())
    }

    async fn get_vault(&self, actor_id: &str, vault_id: &str) -> Result<Vault, MemoryError> {
        let state = self.lock();
        state
            .vaults
            .get(&(actor_id.to_string(), vault_id.to_string()))
            .cloned()
            .ok_or_else(|| MemoryError::not_found("vault", vault_id))
    }

    async fn get_vault_by_title(&self, actor_id: &str, title: &str) -> Result<Vault, MemoryError> {
        let state = self.lock();
        state
            .vaults
            .values()
            .find(|v| v.actor_id == actor_id && v.title == title)
            .cloned()
            .ok_or_else(|| MemoryError::not_found("vault", title))
    }

    async fn enumerate_vault_children(
        &self,
        actor_id: &str,
        vault_id: &str,
    ) -> Result<CascadeChildren, MemoryError> {
        let state = self.lock();
        let mut children = CascadeChildren::default();
        for entry in state.entries.values() {
            if entry.actor_id == actor_id && entry.vault_id == vault_id {
                children.entries.push(EntryRef {
                    memory_id: entry.memory_id.clone(),
                    entry_id: entry.entry_id.clone(),
                });
            }
        }
        for context in state.contexts.values() {
            if context.actor_id == actor_id && context.vault_id == vault_id {
                children.contexts.push(ContextRef {
                    memory_id: context.memory_id.clone(),
                    context_id: context.context_id.clone(),
                });
            }
        }
        Ok(children)
    }

    async fn delete_vault(&self, actor_id: &str, vault_id: &str) -> Result<(), MemoryError> {
        let mut state = self.lock();
        let key = (actor_id.to_string(), vault_id.to_string());
        if !state.vaults.contains_key(&key) {
            return Err(MemoryError::not_found("vault", vault_id));
        }

        let entry_keys: Vec<_> = state
            .entries
            .iter()
            .filter(|(_, e)| e.actor_id == actor_id && e.vault_id == vault_id)
            .map(|(k, e)| (k.clone(), e.entry_id.clone()))
            .collect();
        let context_keys: Vec<_> = state
            .contexts
            .iter()
            .filter(|(_, c)| c.actor_id == actor_id && c.vault_id == vault_id)
            .map(|(k, c)| (k.clone(), c.context_id.clone()))
            .collect();
        let memory_keys: Vec<_> = state
            .memories
            .iter()
            .filter(|(_, m)| m.actor_id == actor_id && m.vault_id == vault_id)
            .map(|(k, _)| k.clone())
            .collect();

        for (k, entry_id) in entry_keys {
            state.entries.remove(&k);
            state.push_outbox(
                OutboxOp::DeleteEntry,
                entry_id.clone(),
                OutboxPayload {
                    actor_id: actor_id.to_string(),
                    vault_id: vault_id.to_string(),
                    memory_id: k.2.clone(),
                    aggregate_id: entry_id,
                    text: None,
                    creation_time: None,
                },
            );
        }
        for (k, context_id) in context_keys {
            state.contexts.remove(&k);
            state.push_outbox(
                OutboxOp::DeleteContext,
                context_id.clone(),
                OutboxPayload {
                    actor_id: actor_id.to_string(),
                    vault_id: vault_id.to_string(),
                    memory_id: k.2.clone(),
                    aggregate_id: context_id,
                    text: None,
                    creation_time: None,
                },
            );
        }
        for k in memory_keys {
            state.memories.remove(&k);
        }
        state.vaults.remove(&key);

        Ok(())
    }

    async fn create_memory(
        &self,
        memory: Memory,
        default_context_document: String,
    ) -> Result<(Memory, MemoryContext), MemoryError> {
        let mut state = self.lock();
        if !state
            .vaults
            .contains_key(&(memory.actor_id.clone(), memory.vault_id.clone()))
        {
            return Err(MemoryError::not_found("vault", memory.vault_id.clone()));
        }
        let key = (
            memory.actor_id.clone(),
            memory.vault_id.clone(),
            memory.memory_id.clone(),
        );
        let title_taken = state.memories.values().any(|m| {
            m.actor_id == memory.actor_id
                && m.vault_id == memory.vault_id
                && m.title == memory.title
        });
        if title_taken {
            return Err(MemoryError::conflict_title("memory", memory.title.clone()));
        }

        let creation_time = state.next_timestamp();
        let mut context = MemoryContext::new(
            memory.actor_id.clone(),
            memory.vault_id.clone(),
            memory.memory_id.clone(),
            default_context_document,
        );
        context.creation_time = creation_time;

        state.memories.insert(key, memory.clone());
        state.contexts.insert(
            (
                context.actor_id.clone(),
                context.vault_id.clone(),
                context.memory_id.clone(),
                context.context_id.clone(),
            ),
            context.clone(),
        );
        state.push_outbox(
            OutboxOp::UpsertContext,
            context.context_id.clone(),
            OutboxPayload {
                actor_id: context.actor_id.clone(),
                vault_id: context.vault_id.clone(),
                memory_id: context.memory_id.clone(),
                aggregate_id: context.context_id.clone(),
                text: Some(context.document.clone()),
                creation_time: Some(context.creation_time),
            },
        );

        Ok((memory, context))
    }

    async fn get_memory(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
    ) -> Result<Memory, MemoryError> {
        let state = self.lock();
        state
            .memories
            .get(&(
                actor_id.to_string(),
                vault_id.to_string(),
                memory_id.to_string(),
            ))
            .cloned()
            .ok_or_else(|| MemoryError::not_found("memory", memory_id))
    }

    async fn list_memories(
        &self,
        actor_id: &str,
        vault_id: &str,
    ) -> Result<Vec<Memory>, MemoryError> {
        let state = self.lock();
        Ok(state
            .memories
            .values()
            .filter(|m| m.actor_id == actor_id && m.vault_id == vault_id)
            .cloned()
            .collect())
    }

    async fn get_memory_by_title(
        &self,
        actor_id: &str,
        vault_id: &str,
        title: &str,
    ) -> Result<Memory, MemoryError> {
        let state = self.lock();
        state
            .memories
            .values()
            .find(|m| m.actor_id == actor_id && m.vault_id == vault_id && m.title == title)
            .cloned()
            .ok_or_else(|| MemoryError::not_found("memory", title))
    }

    async fn enumerate_memory_children(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
    ) -> Result<CascadeChildren, MemoryError> {
        let state = self.lock();
        let mut children = CascadeChildren::default();
        for entry in state.entries.values() {
            if entry.actor_id == actor_id
                && entry.vault_id == vault_id
                && entry.memory_id == memory_id
            {
                children.entries.push(EntryRef {
                    memory_id: entry.memory_id.clone(),
                    entry_id: entry.entry_id.clone(),
                });
            }
        }
        for context in state.contexts.values() {
            if context.actor_id == actor_id
                && context.vault_id == vault_id
                && context.memory_id == memory_id
            {
                children.contexts.push(ContextRef {
                    memory_id: context.memory_id.clone(),
                    context_id: context.context_id.clone(),
                });
            }
        }
        Ok(children)
    }

    async fn delete_memory(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
    ) -> Result<(), MemoryError> {
        let mut state = self.lock();
        let key = (
            actor_id.to_string(),
            vault_id.to_string(),
            memory_id.to_string(),
        );
        if !state.memories.contains_key(&key) {
            return Err(MemoryError::not_found("memory", memory_id));
        }

        let entry_keys: Vec<_> = state
            .entries
            .iter()
            .filter(|(_, e)| {
                e.actor_id == actor_id && e.vault_id == vault_id && e.memory_id == memory_id
            })
            .map(|(k, e)| (k.clone(), e.entry_id.clone()))
            .collect();
        let context_keys: Vec<_> = state
            .contexts
            .iter()
            .filter(|(_, c)| {
                c.actor_id == actor_id && c.vault_id == vault_id && c.memory_id == memory_id
            })
            .map(|(k, c)| (k.clone(), c.context_id.clone()))
            .collect();

        for (k, entry_id) in entry_keys {
            state.entries.remove(&k);
            state.push_outbox(
                OutboxOp::DeleteEntry,
                entry_id.clone(),
                OutboxPayload {
                    actor_id: actor_id.to_string(),
                    vault_id: vault_id.to_string(),
                    memory_id: memory_id.to_string(),
                    aggregate_id: entry_id,
                    text: None,
                    creation_time: None,
                },
            );
        }
        for (k, context_id) in context_keys {
            state.contexts.remove(&k);
            state.push_outbox(
                OutboxOp::DeleteContext,
                context_id.clone(),
                OutboxPayload {
                    actor_id: actor_id.to_string(),
                    vault_id: vault_id.to_string(),
                    memory_id: memory_id.to_string(),
                    aggregate_id: context_id,
                    text: None,
                    creation_time: None,
                },
            );
        }
        state.memories.remove(&key);

        Ok(())
    }

    async fn create_entry(&self, mut entry: MemoryEntry) -> Result<MemoryEntry, MemoryError> {
        let mut state = self.lock();
        let memory_key = (
            entry.actor_id.clone(),
            entry.vault_id.clone(),
            entry.memory_id.clone(),
        );
        if !state.memories.contains_key(&memory_key) {
            return Err(MemoryError::not_found("memory", entry.memory_id.clone()));
        }

        entry.creation_time = state.next_timestamp();
        let key = (
            entry.actor_id.clone(),
            entry.vault_id.clone(),
            entry.memory_id.clone(),
            entry.entry_id.clone(),
        );
        state.entries.insert(key, entry.clone());
        state.push_outbox(
            OutboxOp::UpsertEntry,
            entry.entry_id.clone(),
            OutboxPayload {
                actor_id: entry.actor_id.clone(),
                vault_id: entry.vault_id.clone(),
                memory_id: entry.memory_id.clone(),
                aggregate_id: entry.entry_id.clone(),
                text: Some(
                    entry
                        .summary
                        .clone()
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| entry.raw_entry.clone()),
                ),
                creation_time: Some(entry.creation_time),
            },
        );

        Ok(entry)
    }

    async fn list_entries(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        filter: ListEntriesFilter,
    ) -> Result<Vec<MemoryEntry>, MemoryError> {
        let state = self.lock();
        let mut entries: Vec<MemoryEntry> = state
            .entries
            .values()
            .filter(|e| {
                e.actor_id == actor_id && e.vault_id == vault_id && e.memory_id == memory_id
            })
            .filter(|e| filter.before.map_or(true, |b| e.creation_time < b))
            .filter(|e| filter.after.map_or(true, |a| e.creation_time > a))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.creation_time.cmp(&a.creation_time));
        let limit = filter
            .limit
            .unwrap_or(crate::types::DEFAULT_LIST_LIMIT)
            .min(crate::types::MAX_LIST_LIMIT);
        entries.truncate(limit);
        Ok(entries)
    }

    async fn get_entry(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        entry_id: &str,
    ) -> Result<MemoryEntry, MemoryError> {
        let state = self.lock();
        state
            .entries
            .get(&(
                actor_id.to_string(),
                vault_id.to_string(),
                memory_id.to_string(),
                entry_id.to_string(),
            ))
            .cloned()
            .ok_or_else(|| MemoryError::not_found("entry", entry_id))
    }

    async fn update_entry_tags(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        entry_id: &str,
        tags: serde_json::Value,
    ) -> Result<MemoryEntry, MemoryError> {
        let mut state = self.lock();
        let now = state.next_timestamp();
        let key = (
            actor_id.to_string(),
            vault_id.to_string(),
            memory_id.to_string(),
            entry_id.to_string(),
        );
        let entry = state
            .entries
            .get_mut(&key)
            .ok_or_else(|| MemoryError::not_found("entry", entry_id))?;
        if entry.is_corrected() {
            return Err(MemoryError::already_corrected(entry_id));
        }
        entry.tags = tags;
        entry.last_update_time = Some(now);
        Ok(entry.clone())
    }

    async fn update_entry_summary(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        entry_id: &str,
        summary: String,
    ) -> Result<MemoryEntry, MemoryError> {
        let mut state = self.lock();
        let now = state.next_timestamp();
        let key = (
            actor_id.to_string(),
            vault_id.to_string(),
            memory_id.to_string(),
            entry_id.to_string(),
        );
        let entry = state
            .entries
            .get_mut(&key)
            .ok_or_else(|| MemoryError::not_found("entry", entry_id))?;
        if entry.is_corrected() {
            return Err(MemoryError::already_corrected(entry_id));
        }
        entry.summary = Some(summary);
        entry.last_update_time = Some(now);
        Ok(entry.clone())
    }

    async fn correct_entry(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        original_entry_id: &str,
        mut corrected: MemoryEntry,
        reason: String,
    ) -> Result<(MemoryEntry, MemoryEntry), MemoryError> {
        let mut state = self.lock();
        let original_key = (
            actor_id.to_string(),
            vault_id.to_string(),
            memory_id.to_string(),
            original_entry_id.to_string(),
        );
        {
            let original = state
                .entries
                .get(&original_key)
                .ok_or_else(|| MemoryError::not_found("entry", original_entry_id))?;
            if original.is_corrected() {
                return Err(MemoryError::already_corrected(original_entry_id));
            }
        }

        corrected.creation_time = state.next_timestamp();
        let corrected_key = (
            corrected.actor_id.clone(),
            corrected.vault_id.clone(),
            corrected.memory_id.clone(),
            corrected.entry_id.clone(),
        );
        state.entries.insert(corrected_key, corrected.clone());
        state.push_outbox(
            OutboxOp::UpsertEntry,
            corrected.entry_id.clone(),
            OutboxPayload {
                actor_id: corrected.actor_id.clone(),
                vault_id: corrected.vault_id.clone(),
                memory_id: corrected.memory_id.clone(),
                aggregate_id: corrected.entry_id.clone(),
                text: Some(
                    corrected
                        .summary
                        .clone()
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| corrected.raw_entry.clone()),
                ),
                creation_time: Some(corrected.creation_time),
            },
        );

        let correction_time = state.next_timestamp();
        let original = state
            .entries
            .get_mut(&original_key)
            .expect("original entry checked to exist above");
        original.correction_time = Some(correction_time);
        original.corrected_entry_memory_id = Some(corrected.memory_id.clone());
        original.corrected_entry_creation_time = Some(corrected.creation_time);
        original.correction_reason = Some(reason);

        Ok((original.clone(), corrected))
    }

    async fn delete_entry(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        entry_id: &str,
    ) -> Result<(), MemoryError> {
        let mut state = self.lock();
        let key = (
            actor_id.to_string(),
            vault_id.to_string(),
            memory_id.to_string(),
            entry_id.to_string(),
        );
        if state.entries.remove(&key).is_none() {
            return Err(MemoryError::not_found("entry", entry_id));
        }
        state.push_outbox(
            OutboxOp::DeleteEntry,
            entry_id.to_string(),
            OutboxPayload {
                actor_id: actor_id.to_string(),
                vault_id: vault_id.to_string(),
                memory_id: memory_id.to_string(),
                aggregate_id: entry_id.to_string(),
                text: None,
                creation_time: None,
            },
        );
        Ok(())
    }

    async fn put_context(&self, mut context: MemoryContext) -> Result<MemoryContext, MemoryError> {
        let mut state = self.lock();
        let memory_key = (
            context.actor_id.clone(),
            context.vault_id.clone(),
            context.memory_id.clone(),
        );
        if !state.memories.contains_key(&memory_key) {
            return Err(MemoryError::not_found("memory", context.memory_id.clone()));
        }

        context.creation_time = state.next_timestamp();
        let key = (
            context.actor_id.clone(),
            context.vault_id.clone(),
            context.memory_id.clone(),
            context.context_id.clone(),
        );
        state.contexts.insert(key, context.clone());
        state.push_outbox(
            OutboxOp::UpsertContext,
            context.context_id.clone(),
            OutboxPayload {
                actor_id: context.actor_id.clone(),
                vault_id: context.vault_id.clone(),
                memory_id: context.memory_id.clone(),
                aggregate_id: context.context_id.clone(),
                text: Some(context.document.clone()),
                creation_time: Some(context.creation_time),
            },
        );

        Ok(context)
    }

    async fn latest_context(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
    ) -> Result<MemoryContext, MemoryError> {
        let state = self.lock();
        state
            .contexts
            .values()
            .filter(|c| {
                c.actor_id == actor_id && c.vault_id == vault_id && c.memory_id == memory_id
            })
            .max_by_key(|c| c.creation_time)
            .cloned()
            .ok_or_else(|| MemoryError::not_found("context", memory_id))
    }

    async fn delete_context(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        context_id: &str,
    ) -> Result<(), MemoryError> {
        let mut state = self.lock();
        let key = (
            actor_id.to_string(),
            vault_id.to_string(),
            memory_id.to_string(),
            context_id.to_string(),
        );
        if state.contexts.remove(&key).is_none() {
            return Err(MemoryError::not_found("context", context_id));
        }
        state.push_outbox(
            OutboxOp::DeleteContext,
            context_id.to_string(),
            OutboxPayload {
                actor_id: actor_id.to_string(),
                vault_id: vault_id.to_string(),
                memory_id: memory_id.to_string(),
                aggregate_id: context_id.to_string(),
                text: None,
                creation_time: None,
            },
        );
        Ok(())
    }

    async fn lease_outbox_batch(&self, batch_size: usize) -> Result<Vec<OutboxRow>, MemoryError> {
        let mut state = self.lock();
        let now = Utc::now();
        let ids: Vec<i64> = state
            .outbox
            .iter()
            .filter(|r| r.status == OutboxStatus::Pending && r.next_attempt_at <= now)
            .map(|r| r.id)
            .take(batch_size)
            .collect();

        Ok(state
            .outbox
            .iter()
            .filter(|r| ids.contains(&r.id))
            .cloned()
            .collect())
    }

    async fn mark_outbox_done(&self, id: i64) -> Result<(), MemoryError> {
        let mut state = self.lock();
        let now = Utc::now();
        if let Some(row) = state.outbox.iter_mut().find(|r| r.id == id) {
            row.status = OutboxStatus::Done;
            row.updated_at = now;
        }
        Ok(())
    }

    async fn mark_outbox_failed(&self, id: i64, backoff: Duration) -> Result<(), MemoryError> {
        let mut state = self.lock();
        let now = Utc::now();
        if let Some(row) = state.outbox.iter_mut().find(|r| r.id == id) {
            row.attempt_count += 1;
            row.next_attempt_at = now + backoff;
            row.updated_at = now;
        }
        Ok(())
    }

    async fn oldest_pending_outbox_age(&self) -> Result<Option<Duration>, MemoryError> {
        let state = self.lock();
        let now = Utc::now();
        Ok(state
            .outbox
            .iter()
            .filter(|r| r.status == OutboxStatus::Pending)
            .map(|r| now - r.created_at)
            .max())
    }

    async fn ping(&self) -> Result<(), MemoryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Memory, MemoryType, Vault};

    #[tokio::test]
    async fn create_memory_atomically_inserts_default_context() {
        let store = InMemoryStore::new();
        let vault = store
            .create_vault(Vault::new("actor-1", "v1"))
            .await
            .unwrap();
        let memory = Memory::new(vault.actor_id.clone(), vault.vault_id.clone(), "m1", MemoryType::Conversation);
        let (memory, context) = store
            .create_memory(memory, "default context".to_string())
            .await
            .unwrap();

        let latest = store
            .latest_context(&memory.actor_id, &memory.vault_id, &memory.memory_id)
            .await
            .unwrap();
        assert_eq!(latest.context_id, context.context_id);

        let batch = store.lease_outbox_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].op, OutboxOp::UpsertContext);
    }

    #[tokio::test]
    async fn correcting_entry_twice_fails() {
        let store = InMemoryStore::new();
        let vault = store.create_vault(Vault::new("a", "v")).await.unwrap();
        let memory = Memory::new(vault.actor_id.clone(), vault.vault_id.clone(), "m", MemoryType::Conversation);
        let (memory, _) = store.create_memory(memory, "default".into()).await.unwrap();
        let entry = store
            .create_entry(MemoryEntry::new(
                memory.actor_id.clone(),
                memory.vault_id.clone(),
                memory.memory_id.clone(),
                "original text",
            ))
            .await
            .unwrap();

        let corrected = MemoryEntry::new(
            entry.actor_id.clone(),
            entry.vault_id.clone(),
            entry.memory_id.clone(),
            "corrected text",
        );
        store
            .correct_entry(
                &entry.actor_id,
                &entry.vault_id,
                &entry.memory_id,
                &entry.entry_id,
                corrected,
                "typo".to_string(),
            )
            .await
            .unwrap();

        let again = MemoryEntry::new(
            entry.actor_id.clone(),
            entry.vault_id.clone(),
            entry.memory_id.clone(),
            "another correction",
        );
        let err = store
            .correct_entry(
                &entry.actor_id,
                &entry.vault_id,
                &entry.memory_id,
                &entry.entry_id,
                again,
                "again".to_string(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::ImmutabilityViolation(_)));
    }

    #[tokio::test]
    async fn delete_vault_cascades_and_emits_outbox_rows() {
        let store = InMemoryStore::new();
        let vault = store.create_vault(Vault::new("a", "v")).await.unwrap();
        let memory = Memory::new(vault.actor_id.clone(), vault.vault_id.clone(), "m", MemoryType::Conversation);
        let (memory, _) = store.create_memory(memory, "default".into()).await.unwrap();
        store
            .create_entry(MemoryEntry::new(
                memory.actor_id.clone(),
                memory.vault_id.clone(),
                memory.memory_id.clone(),
                "text",
            ))
            .await
            .unwrap();

        store.delete_vault(&vault.actor_id, &vault.vault_id).await.unwrap();

        assert!(store.get_vault(&vault.actor_id, &vault.vault_id).await.is_err());
        let err = store.get_memory(&memory.actor_id, &memory.vault_id, &memory.memory_id).await;
        assert!(err.is_err());
    }
}
