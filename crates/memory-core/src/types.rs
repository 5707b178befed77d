use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A vault groups memories for one actor. Title is unique within the actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vault {
    pub actor_id: String,
    pub vault_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl Vault {
    pub fn new(actor_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            vault_id: Uuid::new_v4().to_string(),
            title: title.into(),
            created_at: Utc::now(),
        }
    }
}

/// Memory type, used only for display/filtering; no behavior branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Conversation,
    Project,
    Other,
}

/// A memory owns an append-only entry log and a series of context snapshots.
/// Title is unique within its vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub actor_id: String,
    pub vault_id: String,
    pub memory_id: String,
    pub title: String,
    pub memory_type: MemoryType,
    pub created_at: DateTime<Utc>,
}

impl Memory {
    pub fn new(
        actor_id: impl Into<String>,
        vault_id: impl Into<String>,
        title: impl Into<String>,
        memory_type: MemoryType,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            vault_id: vault_id.into(),
            memory_id: Uuid::new_v4().to_string(),
            title: title.into(),
            memory_type,
            created_at: Utc::now(),
        }
    }
}

/// An append-only entry in a memory. `raw_entry` and `metadata` are immutable
/// after creation; `summary` and `tags` may be updated; correction fields are
/// set exactly once by `correct_entry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub actor_id: String,
    pub vault_id: String,
    pub memory_id: String,
    pub entry_id: String,
    pub creation_time: DateTime<Utc>,
    pub raw_entry: String,
    pub summary: Option<String>,
    pub metadata: JsonValue,
    pub tags: JsonValue,
    // TODO: nothing currently reaps entries past expiration_time; add a sweep
    // once a deletion policy (hard delete vs tombstone) is decided.
    pub expiration_time: Option<DateTime<Utc>>,
    pub last_update_time: Option<DateTime<Utc>>,
    pub correction_time: Option<DateTime<Utc>>,
    pub corrected_entry_memory_id: Option<String>,
    pub corrected_entry_creation_time: Option<DateTime<Utc>>,
    pub correction_reason: Option<String>,
}

impl MemoryEntry {
    pub fn new(
        actor_id: impl Into<String>,
        vault_id: impl Into<String>,
        memory_id: impl Into<String>,
        raw_entry: impl Into<String>,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            vault_id: vault_id.into(),
            memory_id: memory_id.into(),
            entry_id: Uuid::new_v4().to_string(),
            creation_time: Utc::now(),
            raw_entry: raw_entry.into(),
            summary: None,
            metadata: JsonValue::Object(Default::default()),
            tags: JsonValue::Object(Default::default()),
            expiration_time: None,
            last_update_time: None,
            correction_time: None,
            corrected_entry_memory_id: None,
            corrected_entry_creation_time: None,
            correction_reason: None,
        }
    }

    pub fn is_corrected(&self) -> bool {
        self.correction_time.is_some()
    }
}

/// An append-only context snapshot. The snapshot with the largest
/// `creation_time` for a memory is its "latest context".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryContext {
    pub actor_id: String,
    pub vault_id: String,
    pub memory_id: String,
    pub context_id: String,
    pub creation_time: DateTime<Utc>,
    pub document: String,
}

impl MemoryContext {
    pub fn new(
        actor_id: impl Into<String>,
        vault_id: impl Into<String>,
        memory_id: impl Into<String>,
        document: impl Into<String>,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            vault_id: vault_id.into(),
            memory_id: memory_id.into(),
            context_id: Uuid::new_v4().to_string(),
            creation_time: Utc::now(),
            document: document.into(),
        }
    }
}

/// Request to append a new entry.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateEntryRequest {
    pub raw_entry: String,
    pub summary: Option<String>,
    #[serde(default = "default_json_object")]
    pub metadata: JsonValue,
    #[serde(default = "default_json_object")]
    pub tags: JsonValue,
    pub expiration_time: Option<DateTime<Utc>>,
}

fn default_json_object() -> JsonValue {
    JsonValue::Object(Default::default())
}

/// Request to correct an existing entry. Produces a new entry and marks the
/// original's correction pointers (I2, I3, I4).
#[derive(Debug, Clone, Deserialize)]
pub struct CorrectEntryRequest {
    pub raw_entry: String,
    pub summary: Option<String>,
    pub reason: String,
}

/// Filter for listing entries. `before`/`after` are mutually exclusive.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListEntriesFilter {
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Default entries-per-page limit when the caller specifies none.
pub const DEFAULT_LIST_LIMIT: usize = 100;
/// Upper bound on entries returned per page regardless of requested limit.
pub const MAX_LIST_LIMIT: usize = 1000;

/// Outbox operation kind. Drives the worker's handler dispatch (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxOp {
    UpsertEntry,
    DeleteEntry,
    UpsertContext,
    DeleteContext,
}

/// Outbox row status. `Pending` rows are eligible for leasing; `Done` rows
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Done,
}

/// Minimum fields the index needs to apply an outbox row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxPayload {
    pub actor_id: String,
    pub vault_id: String,
    pub memory_id: String,
    pub aggregate_id: String,
    pub text: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
}

/// A row in the transactional outbox table (C2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRow {
    pub id: i64,
    pub aggregate_id: String,
    pub op: OutboxOp,
    pub payload: OutboxPayload,
    pub status: OutboxStatus,
    pub attempt_count: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single hybrid-search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub entry_id: String,
    pub actor_id: String,
    pub memory_id: String,
    pub summary: Option<String>,
    pub raw_entry: String,
    pub score: f32,
}

/// Full response for a search call, including latest/best context (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub entries: Vec<SearchHit>,
    pub count: usize,
    pub latest_context: Option<String>,
    pub latest_context_timestamp: Option<DateTime<Utc>>,
    pub best_context: Option<String>,
    pub best_context_timestamp: Option<DateTime<Utc>>,
    pub best_context_score: Option<f32>,
}

/// Query parameters for a hybrid search call.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub top_k: Option<usize>,
}

/// Default number of hits returned by search when the caller specifies none.
pub const DEFAULT_SEARCH_TOP_K: usize = 10;
