use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use memory_core::error::MemoryError;
use memory_core::store::{CascadeChildren, ContextRef, EntryRef, Store};
use memory_core::types::{
    ListEntriesFilter, Memory, MemoryContext, MemoryEntry, MemoryType, OutboxOp, OutboxPayload,
    OutboxRow, OutboxStatus, Vault,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

/// How long a leased row is hidden from other workers before it is considered
/// abandoned and becomes eligible again. Bumped on `next_attempt_at` inside
/// the same transaction that selects the row, so the `SKIP LOCKED` row lock
/// has a durable effect after commit.
const OUTBOX_LEASE_SECONDS: i64 = 30;

/// PostgreSQL-backed `Store` (C1). Every mutating method runs inside a
/// single transaction so the domain write and its outbox row commit or roll
/// back together (I5).
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, MemoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| MemoryError::Store(format!("postgres connect failed: {e}")))?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), MemoryError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS memory_vaults (
                actor_id TEXT NOT NULL,
                vault_id TEXT NOT NULL,
                title TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (actor_id, vault_id)
            )
            "#,
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_memory_vaults_title ON memory_vaults (actor_id, title)",
            r#"
            CREATE TABLE IF NOT EXISTS memory_memories (
                actor_id TEXT NOT NULL,
                vault_id TEXT NOT NULL,
                memory_id TEXT NOT NULL,
                title TEXT NOT NULL,
                memory_type TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (actor_id, vault_id, memory_id)
            )
            "#,
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_memory_memories_title ON memory_memories (actor_id, vault_id, title)",
            r#"
            CREATE TABLE IF NOT EXISTS memory_entries (
                actor_id TEXT NOT NULL,
                vault_id TEXT NOT NULL,
                memory_id TEXT NOT NULL,
                entry_id TEXT NOT NULL UNIQUE,
                creation_time TIMESTAMPTZ NOT NULL,
                raw_entry TEXT NOT NULL,
                summary TEXT,
                metadata JSONB NOT NULL,
                tags JSONB NOT NULL,
                expiration_time TIMESTAMPTZ,
                last_update_time TIMESTAMPTZ,
                correction_time TIMESTAMPTZ,
                corrected_entry_memory_id TEXT,
                corrected_entry_creation_time TIMESTAMPTZ,
                correction_reason TEXT,
                PRIMARY KEY (actor_id, vault_id, memory_id, entry_id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_memory_entries_creation ON memory_entries (actor_id, vault_id, memory_id, creation_time)",
            r#"
            CREATE TABLE IF NOT EXISTS memory_contexts (
                actor_id TEXT NOT NULL,
                vault_id TEXT NOT NULL,
                memory_id TEXT NOT NULL,
                context_id TEXT NOT NULL UNIQUE,
                creation_time TIMESTAMPTZ NOT NULL,
                document TEXT NOT NULL,
                PRIMARY KEY (actor_id, vault_id, memory_id, context_id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_memory_contexts_creation ON memory_contexts (actor_id, vault_id, memory_id, creation_time)",
            r#"
            CREATE TABLE IF NOT EXISTS memory_outbox (
                id BIGSERIAL PRIMARY KEY,
                aggregate_id TEXT NOT NULL,
                op TEXT NOT NULL,
                actor_id TEXT NOT NULL,
                vault_id TEXT NOT NULL,
                memory_id TEXT NOT NULL,
                payload_text TEXT,
                payload_creation_time TIMESTAMPTZ,
                status TEXT NOT NULL,
                attempt_count INT NOT NULL DEFAULT 0,
                next_attempt_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_memory_outbox_pending ON memory_outbox (status, next_attempt_at)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| MemoryError::Store(format!("schema bootstrap failed: {e}")))?;
        }

        Ok(())
    }
}

fn store_err(context: &str, e: sqlx::Error) -> MemoryError {
    MemoryError::Store(format!("{context}: {e}"))
}

fn row_to_vault(row: &sqlx::postgres::PgRow) -> Result<Vault, MemoryError> {
    Ok(Vault {
        actor_id: row.try_get("actor_id").map_err(|e| store_err("decode vault", e))?,
        vault_id: row.try_get("vault_id").map_err(|e| store_err("decode vault", e))?,
        title: row.try_get("title").map_err(|e| store_err("decode vault", e))?,
        created_at: row.try_get("created_at").map_err(|e| store_err("decode vault", e))?,
    })
}

fn row_to_memory(row: &sqlx::postgres::PgRow) -> Result<Memory, MemoryError> {
    let memory_type: String = row.try_get("memory_type").map_err(|e| store_err("decode memory", e))?;
    Ok(Memory {
        actor_id: row.try_get("actor_id").map_err(|e| store_err("decode memory", e))?,
        vault_id: row.try_get("vault_id").map_err(|e| store_err("decode memory", e))?,
        memory_id: row.try_get("memory_id").map_err(|e| store_err("decode memory", e))?,
        title: row.try_get("title").map_err(|e| store_err("decode memory", e))?,
        memory_type: parse_memory_type(&memory_type)?,
        created_at: row.try_get("created_at").map_err(|e| store_err("decode memory", e))?,
    })
}

fn memory_type_to_str(memory_type: MemoryType) -> &'static str {
    match memory_type {
        MemoryType::Conversation => "conversation",
        MemoryType::Project => "project",
        MemoryType::Other => "other",
    }
}

fn parse_memory_type(value: &str) -> Result<MemoryType, MemoryError> {
    match value {
        "conversation" => Ok(MemoryType::Conversation),
        "project" => Ok(MemoryType::Project),
        "other" => Ok(MemoryType::Other),
        other => Err(MemoryError::Store(format!("unknown memory_type '{other}' in storage"))),
    }
}

fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<MemoryEntry, MemoryError> {
    Ok(MemoryEntry {
        actor_id: row.try_get("actor_id").map_err(|e| store_err("decode entry", e))?,
        vault_id: row.try_get("vault_id").map_err(|e| store_err("decode entry", e))?,
        memory_id: row.try_get("memory_id").map_err(|e| store_err("decode entry", e))?,
        entry_id: row.try_get("entry_id").map_err(|e| store_err("decode entry", e))?,
        creation_time: row.try_get("creation_time").map_err(|e| store_err("decode entry", e))?,
        raw_entry: row.try_get("raw_entry").map_err(|e| store_err("decode entry", e))?,
        summary: row.try_get("summary").map_err(|e| store_err("decode entry", e))?,
        metadata: row.try_get("metadata").map_err(|e| store_err("decode entry", e))?,
        tags: row.try_get("tags").map_err(|e| store_err("decode entry", e))?,
        expiration_time: row.try_get("expiration_time").map_err(|e| store_err("decode entry", e))?,
        last_update_time: row.try_get("last_update_time").map_err(|e| store_err("decode entry", e))?,
        correction_time: row.try_get("correction_time").map_err(|e| store_err("decode entry", e))?,
        corrected_entry_memory_id: row
            .try_get("corrected_entry_memory_id")
            .map_err(|e| store_err("decode entry", e))?,
        corrected_entry_creation_time: row
            .try_get("corrected_entry_creation_time")
            .map_err(|e| store_err("decode entry", e))?,
        correction_reason: row.try_get("correction_reason").map_err(|e| store_err("decode entry", e))?,
    })
}

fn row_to_context(row: &sqlx::postgres::PgRow) -> Result<MemoryContext, MemoryError> {
    Ok(MemoryContext {
        actor_id: row.try_get("actor_id").map_err(|e| store_err("decode context", e))?,
        vault_id: row.try_get("vault_id").map_err(|e| store_err("decode context", e))?,
        memory_id: row.try_get("memory_id").map_err(|e| store_err("decode context", e))?,
        context_id: row.try_get("context_id").map_err(|e| store_err("decode context", e))?,
        creation_time: row.try_get("creation_time").map_err(|e| store_err("decode context", e))?,
        document: row.try_get("document").map_err(|e| store_err("decode context", e))?,
    })
}

fn op_to_str(op: OutboxOp) -> &'static str {
    match op {
        OutboxOp::UpsertEntry => "upsert_entry",
        OutboxOp::DeleteEntry => "delete_entry",
        OutboxOp::UpsertContext => "upsert_context",
        OutboxOp::DeleteContext => "delete_context",
    }
}

fn parse_op(value: &str) -> Result<OutboxOp, MemoryError> {
    match value {
        "upsert_entry" => Ok(OutboxOp::UpsertEntry),
        "delete_entry" => Ok(OutboxOp::DeleteEntry),
        "upsert_context" => Ok(OutboxOp::UpsertContext),
        "delete_context" => Ok(OutboxOp::DeleteContext),
        other => Err(MemoryError::Store(format!("unknown outbox op '{other}' in storage"))),
    }
}

fn row_to_outbox(row: &sqlx::postgres::PgRow) -> Result<OutboxRow, MemoryError> {
    let op: String = row.try_get("op").map_err(|e| store_err("decode outbox", e))?;
    let status: String = row.try_get("status").map_err(|e| store_err("decode outbox", e))?;
    Ok(OutboxRow {
        id: row.try_get("id").map_err(|e| store_err("decode outbox", e))?,
        aggregate_id: row.try_get("aggregate_id").map_err(|e| store_err("decode outbox", e))?,
        op: parse_op(&op)?,
        payload: OutboxPayload {
            actor_id: row.try_get("actor_id").map_err(|e| store_err("decode outbox", e))?,
            vault_id: row.try_get("vault_id").map_err(|e| store_err("decode outbox", e))?,
            memory_id: row.try_get("memory_id").map_err(|e| store_err("decode outbox", e))?,
            aggregate_id: row.try_get("aggregate_id").map_err(|e| store_err("decode outbox", e))?,
            text: row.try_get("payload_text").map_err(|e| store_err("decode outbox", e))?,
            creation_time: row
                .try_get("payload_creation_time")
                .map_err(|e| store_err("decode outbox", e))?,
        },
        status: if status == "pending" {
            OutboxStatus::Pending
        } else {
            OutboxStatus::Done
        },
        attempt_count: row.try_get("attempt_count").map_err(|e| store_err("decode outbox", e))?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(|e| store_err("decode outbox", e))?,
        created_at: row.try_get("created_at").map_err(|e| store_err("decode outbox", e))?,
        updated_at: row.try_get("updated_at").map_err(|e| store_err("decode outbox", e))?,
    })
}

async fn insert_outbox_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    op: OutboxOp,
    aggregate_id: &str,
    actor_id: &str,
    vault_id: &str,
    memory_id: &str,
    text: Option<&str>,
    creation_time: Option<DateTime<Utc>>,
) -> Result<(), MemoryError> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO memory_outbox (
            aggregate_id, op, actor_id, vault_id, memory_id,
            payload_text, payload_creation_time, status, attempt_count,
            next_attempt_at, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', 0, $8, $8, $8)
        "#,
    )
    .bind(aggregate_id)
    .bind(op_to_str(op))
    .bind(actor_id)
    .bind(vault_id)
    .bind(memory_id)
    .bind(text)
    .bind(creation_time)
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(|e| store_err("insert outbox row", e))?;
    Ok(())
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_vault(&self, vault: Vault) -> Result<Vault, MemoryError> {
        let existing = sqlx::query("SELECT 1 FROM memory_vaults WHERE actor_id = $1 AND title = $2")
            .bind(&vault.actor_id)
            .bind(&vault.title)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_err("check vault title", e))?;
        if existing.is_some() {
            return Err(MemoryError::conflict_title("vault", vault.title.clone()));
        }

        sqlx::query(
            "INSERT INTO memory_vaults (actor_id, vault_id, title, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(&vault.actor_id)
        .bind(&vault.vault_id)
        .bind(&vault.title)
        .bind(vault.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("insert vault", e))?;

        Ok(vault)
    }

    async fn list_vaults(&self, actor_id: &str) -> Result<Vec<Vault>, MemoryError> {
        let rows = sqlx::query("SELECT * FROM memory_vaults WHERE actor_id = $1 ORDER BY created_at ASC")
            .bind(actor_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| store_err("list vaults", e))?;
        rows.iter().map(row_to_vault).collect()
    }

    async fn get_vault(&self, actor_id: &str, vault_id: &str) -> Result<Vault, MemoryError> {
        let row = sqlx::query("SELECT * FROM memory_vaults WHERE actor_id = $1 AND vault_id = $2")
            .bind(actor_id)
            .bind(vault_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_err("get vault", e))?
            .ok_or_else(|| MemoryError::not_found("vault", vault_id))?;
        row_to_vault(&row)
    }

    async fn get_vault_by_title(&self, actor_id: &str, title: &str) -> Result<Vault, MemoryError> {
        let row = sqlx::query("SELECT * FROM memory_vaults WHERE actor_id = $1 AND title = $2")
            .bind(actor_id)
            .bind(title)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_err("get vault by title", e))?
            .ok_or_else(|| MemoryError::not_found("vault", title))?;
        row_to_vault(&row)
    }

    async fn enumerate_vault_children(
        &self,
        actor_id: &str,
        vault_id: &str,
    ) -> Result<CascadeChildren, MemoryError> {
        let entry_rows = sqlx::query(
            "SELECT memory_id, entry_id FROM memory_entries WHERE actor_id = $1 AND vault_id = $2",
        )
        .bind(actor_id)
        .bind(vault_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err("enumerate vault entries", e))?;
        let context_rows = sqlx::query(
            "SELECT memory_id, context_id FROM memory_contexts WHERE actor_id = $1 AND vault_id = $2",
        )
        .bind(actor_id)
        .bind(vault_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err("enumerate vault contexts", e))?;

        let mut children = CascadeChildren::default();
        for row in entry_rows {
            children.entries.push(EntryRef {
                memory_id: row.try_get("memory_id").map_err(|e| store_err("decode entry ref", e))?,
                entry_id: row.try_get("entry_id").map_err(|e| store_err("decode entry ref", e))?,
            });
        }
        for row in context_rows {
            children.contexts.push(ContextRef {
                memory_id: row.try_get("memory_id").map_err(|e| store_err("decode context ref", e))?,
                context_id: row.try_get("context_id").map_err(|e| store_err("decode context ref", e))?,
            });
        }
        Ok(children)
    }

    async fn delete_vault(&self, actor_id: &str, vault_id: &str) -> Result<(), MemoryError> {
        let mut tx = self.pool.begin().await.map_err(|e| store_err("begin delete_vault", e))?;

        let existing = sqlx::query("SELECT 1 FROM memory_vaults WHERE actor_id = $1 AND vault_id = $2")
            .bind(actor_id)
            .bind(vault_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| store_err("check vault exists", e))?;
        if existing.is_none() {
            return Err(MemoryError::not_found("vault", vault_id));
        }

        let entry_rows = sqlx::query(
            "SELECT memory_id, entry_id FROM memory_entries WHERE actor_id = $1 AND vault_id = $2",
        )
        .bind(actor_id)
        .bind(vault_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| store_err("enumerate entries for delete", e))?;
        let context_rows = sqlx::query(
            "SELECT memory_id, context_id FROM memory_contexts WHERE actor_id = $1 AND vault_id = $2",
        )
        .bind(actor_id)
        .bind(vault_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| store_err("enumerate contexts for delete", e))?;

        for row in &entry_rows {
            let memory_id: String = row.try_get("memory_id").map_err(|e| store_err("decode entry ref", e))?;
            let entry_id: String = row.try_get("entry_id").map_err(|e| store_err("decode entry ref", e))?;
            insert_outbox_row(
                &mut tx,
                OutboxOp::DeleteEntry,
                &entry_id,
                actor_id,
                vault_id,
                &memory_id,
                None,
                None,
            )
            .await?;
        }
        for row in &context_rows {
            let memory_id: String = row.try_get("memory_id").map_err(|e| store_err("decode context ref", e))?;
            let context_id: String = row.try_get("context_id").map_err(|e| store_err("decode context ref", e))?;
            insert_outbox_row(
                &mut tx,
                OutboxOp::DeleteContext,
                &context_id,
                actor_id,
                vault_id,
                &memory_id,
                None,
                None,
            )
            .await?;
        }

        sqlx::query("DELETE FROM memory_entries WHERE actor_id = $1 AND vault_id = $2")
            .bind(actor_id)
            .bind(vault_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_err("delete entries", e))?;
        sqlx::query("DELETE FROM memory_contexts WHERE actor_id = $1 AND vault_id = $2")
            .bind(actor_id)
            .bind(vault_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_err("delete contexts", e))?;
        sqlx::query("DELETE FROM memory_memories WHERE actor_id = $1 AND vault_id = $2")
            .bind(actor_id)
            .bind(vault_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_err("delete memories", e))?;
        sqlx::query("DELETE FROM memory_vaults WHERE actor_id = $1 AND vault_id = $2")
            .bind(actor_id)
            .bind(vault_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_err("delete vault", e))?;

        tx.commit().await.map_err(|e| store_err("commit delete_vault", e))?;
        Ok(())
    }

    async fn create_memory(
        &self,
        memory: Memory,
        default_context_document: String,
    ) -> Result<(Memory, MemoryContext), MemoryError> {
        let mut tx = self.pool.begin().await.map_err(|e| store_err("begin create_memory", e))?;

        let vault_exists = sqlx::query("SELECT 1 FROM memory_vaults WHERE actor_id = $1 AND vault_id = $2")
            .bind(&memory.actor_id)
            .bind(&memory.vault_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| store_err("check vault exists", e))?;
        if vault_exists.is_none() {
            return Err(MemoryError::not_found("vault", memory.vault_id.clone()));
        }

        let title_taken = sqlx::query(
            "SELECT 1 FROM memory_memories WHERE actor_id = $1 AND vault_id = $2 AND title = $3",
        )
        .bind(&memory.actor_id)
        .bind(&memory.vault_id)
        .bind(&memory.title)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| store_err("check memory title", e))?;
        if title_taken.is_some() {
            return Err(MemoryError::conflict_title("memory", memory.title.clone()));
        }

        sqlx::query(
            "INSERT INTO memory_memories (actor_id, vault_id, memory_id, title, memory_type, created_at) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&memory.actor_id)
        .bind(&memory.vault_id)
        .bind(&memory.memory_id)
        .bind(&memory.title)
        .bind(memory_type_to_str(memory.memory_type))
        .bind(memory.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| store_err("insert memory", e))?;

        let context = MemoryContext::new(
            memory.actor_id.clone(),
            memory.vault_id.clone(),
            memory.memory_id.clone(),
            default_context_document,
        );
        sqlx::query(
            "INSERT INTO memory_contexts (actor_id, vault_id, memory_id, context_id, creation_time, document) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&context.actor_id)
        .bind(&context.vault_id)
        .bind(&context.memory_id)
        .bind(&context.context_id)
        .bind(context.creation_time)
        .bind(&context.document)
        .execute(&mut *tx)
        .await
        .map_err(|e| store_err("insert default context", e))?;

        insert_outbox_row(
            &mut tx,
            OutboxOp::UpsertContext,
            &context.context_id,
            &context.actor_id,
            &context.vault_id,
            &context.memory_id,
            Some(&context.document),
            Some(context.creation_time),
        )
        .await?;

        tx.commit().await.map_err(|e| store_err("commit create_memory", e))?;
        Ok((memory, context))
    }

    async fn get_memory(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
    ) -> Result<Memory, MemoryError> {
        let row = sqlx::query(
            "SELECT * FROM memory_memories WHERE actor_id = $1 AND vault_id = $2 AND memory_id = $3",
        )
        .bind(actor_id)
        .bind(vault_id)
        .bind(memory_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_err("get memory", e))?
        .ok_or_else(|| MemoryError::not_found("memory", memory_id))?;
        row_to_memory(&row)
    }

    async fn list_memories(&self, actor_id: &str, vault_id: &str) -> Result<Vec<Memory>, MemoryError> {
        let rows = sqlx::query(
            "SELECT * FROM memory_memories WHERE actor_id = $1 AND vault_id = $2 ORDER BY created_at ASC",
        )
        .bind(actor_id)
        .bind(vault_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err("list memories", e))?;
        rows.iter().map(row_to_memory).collect()
    }

    async fn get_memory_by_title(
        &self,
        actor_id: &str,
        vault_id: &str,
        title: &str,
    ) -> Result<Memory, MemoryError> {
        let row = sqlx::query(
            "SELECT * FROM memory_memories WHERE actor_id = $1 AND vault_id = $2 AND title = $3",
        )
        .bind(actor_id)
        .bind(vault_id)
        .bind(title)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_err("get memory by title", e))?
        .ok_or_else(|| MemoryError::not_found("memory", title))?;
        row_to_memory(&row)
    }

    async fn enumerate_memory_children(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
    ) -> Result<CascadeChildren, MemoryError> {
        let entry_rows = sqlx::query(
            "SELECT entry_id FROM memory_entries WHERE actor_id = $1 AND vault_id = $2 AND memory_id = $3",
        )
        .bind(actor_id)
        .bind(vault_id)
        .bind(memory_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err("enumerate memory entries", e))?;
        let context_rows = sqlx::query(
            "SELECT context_id FROM memory_contexts WHERE actor_id = $1 AND vault_id = $2 AND memory_id = $3",
        )
        .bind(actor_id)
        .bind(vault_id)
        .bind(memory_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err("enumerate memory contexts", e))?;

        let mut children = CascadeChildren::default();
        for row in entry_rows {
            children.entries.push(EntryRef {
                memory_id: memory_id.to_string(),
                entry_id: row.try_get("entry_id").map_err(|e| store_err("decode entry ref", e))?,
            });
        }
        for row in context_rows {
            children.contexts.push(ContextRef {
                memory_id: memory_id.to_string(),
                context_id: row.try_get("context_id").map_err(|e| store_err("decode context ref", e))?,
            });
        }
        Ok(children)
    }

    async fn delete_memory(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
    ) -> Result<(), MemoryError> {
        let mut tx = self.pool.begin().await.map_err(|e| store_err("begin delete_memory", e))?;

        let exists = sqlx::query(
            "SELECT 1 FROM memory_memories WHERE actor_id = $1 AND vault_id = $2 AND memory_id = $3",
        )
        .bind(actor_id)
        .bind(vault_id)
        .bind(memory_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| store_err("check memory exists", e))?;
        if exists.is_none() {
            return Err(MemoryError::not_found("memory", memory_id));
        }

        let entry_rows = sqlx::query(
            "SELECT entry_id FROM memory_entries WHERE actor_id = $1 AND vault_id = $2 AND memory_id = $3",
        )
        .bind(actor_id)
        .bind(vault_id)
        .bind(memory_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| store_err("enumerate entries for delete", e))?;
        let context_rows = sqlx::query(
            "SELECT context_id FROM memory_contexts WHERE actor_id = $1 AND vault_id = $2 AND memory_id = $3",
        )
        .bind(actor_id)
        .bind(vault_id)
        .bind(memory_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| store_err("enumerate contexts for delete", e))?;

        for row in &entry_rows {
            let entry_id: String = row.try_get("entry_id").map_err(|e| store_err("decode entry ref", e))?;
            insert_outbox_row(
                &mut tx,
                OutboxOp::DeleteEntry,
                &entry_id,
                actor_id,
                vault_id,
                memory_id,
                None,
                None,
            )
            .await?;
        }
        for row in &context_rows {
            let context_id: String = row.try_get("context_id").map_err(|e| store_err("decode context ref", e))?;
            insert_outbox_row(
                &mut tx,
                OutboxOp::DeleteContext,
                &context_id,
                actor_id,
                vault_id,
                memory_id,
                None,
                None,
            )
            .await?;
        }

        sqlx::query("DELETE FROM memory_entries WHERE actor_id = $1 AND vault_id = $2 AND memory_id = $3")
            .bind(actor_id)
            .bind(vault_id)
            .bind(memory_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_err("delete entries", e))?;
        sqlx::query("DELETE FROM memory_contexts WHERE actor_id = $1 AND vault_id = $2 AND memory_id = $3")
            .bind(actor_id)
            .bind(vault_id)
            .bind(memory_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_err("delete contexts", e))?;
        sqlx::query("DELETE FROM memory_memories WHERE actor_id = $1 AND vault_id = $2 AND memory_id = $3")
            .bind(actor_id)
            .bind(vault_id)
            .bind(memory_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_err("delete memory", e))?;

        tx.commit().await.map_err(|e| store_err("commit delete_memory", e))?;
        Ok(())
    }

    async fn create_entry(&self, entry: MemoryEntry) -> Result<MemoryEntry, MemoryError> {
        let mut tx = self.pool.begin().await.map_err(|e| store_err("begin create_entry", e))?;

        let memory_exists = sqlx::query(
            "SELECT 1 FROM memory_memories WHERE actor_id = $1 AND vault_id = $2 AND memory_id = $3",
        )
        .bind(&entry.actor_id)
        .bind(&entry.vault_id)
        .bind(&entry.memory_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| store_err("check memory exists", e))?;
        if memory_exists.is_none() {
            return Err(MemoryError::not_found("memory", entry.memory_id.clone()));
        }

        sqlx::query(
            r#"
            INSERT INTO memory_entries (
                actor_id, vault_id, memory_id, entry_id, creation_time,
                raw_entry, summary, metadata, tags, expiration_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&entry.actor_id)
        .bind(&entry.vault_id)
        .bind(&entry.memory_id)
        .bind(&entry.entry_id)
        .bind(entry.creation_time)
        .bind(&entry.raw_entry)
        .bind(&entry.summary)
        .bind(&entry.metadata)
        .bind(&entry.tags)
        .bind(entry.expiration_time)
        .execute(&mut *tx)
        .await
        .map_err(|e| store_err("insert entry", e))?;

        let text = entry
            .summary
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| entry.raw_entry.clone());
        insert_outbox_row(
            &mut tx,
            OutboxOp::UpsertEntry,
            &entry.entry_id,
            &entry.actor_id,
            &entry.vault_id,
            &entry.memory_id,
            Some(&text),
            Some(entry.creation_time),
        )
        .await?;

        tx.commit().await.map_err(|e| store_err("commit create_entry", e))?;
        Ok(entry)
    }

    async fn list_entries(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        filter: ListEntriesFilter,
    ) -> Result<Vec<MemoryEntry>, MemoryError> {
        let limit = filter
            .limit
            .unwrap_or(memory_core::types::DEFAULT_LIST_LIMIT)
            .min(memory_core::types::MAX_LIST_LIMIT) as i64;

        let rows = if let Some(before) = filter.before {
            sqlx::query(
                "SELECT * FROM memory_entries WHERE actor_id = $1 AND vault_id = $2 AND memory_id = $3 AND creation_time < $4 ORDER BY creation_time DESC LIMIT $5",
            )
            .bind(actor_id)
            .bind(vault_id)
            .bind(memory_id)
            .bind(before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else if let Some(after) = filter.after {
            sqlx::query(
                "SELECT * FROM memory_entries WHERE actor_id = $1 AND vault_id = $2 AND memory_id = $3 AND creation_time > $4 ORDER BY creation_time DESC LIMIT $5",
            )
            .bind(actor_id)
            .bind(vault_id)
            .bind(memory_id)
            .bind(after)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query(
                "SELECT * FROM memory_entries WHERE actor_id = $1 AND vault_id = $2 AND memory_id = $3 ORDER BY creation_time DESC LIMIT $4",
            )
            .bind(actor_id)
            .bind(vault_id)
            .bind(memory_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| store_err("list entries", e))?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn get_entry(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        entry_id: &str,
    ) -> Result<MemoryEntry, MemoryError> {
        let row = sqlx::query(
            "SELECT * FROM memory_entries WHERE actor_id = $1 AND vault_id = $2 AND memory_id = $3 AND entry_id = $4",
        )
        .bind(actor_id)
        .bind(vault_id)
        .bind(memory_id)
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_err("get entry", e))?
        .ok_or_else(|| MemoryError::not_found("entry", entry_id))?;
        row_to_entry(&row)
    }

    async fn update_entry_tags(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        entry_id: &str,
        tags: serde_json::Value,
    ) -> Result<MemoryEntry, MemoryError> {
        let current = self.get_entry(actor_id, vault_id, memory_id, entry_id).await?;
        if current.is_corrected() {
            return Err(MemoryError::already_corrected(entry_id));
        }

        let now = Utc::now();
        let row = sqlx::query(
            "UPDATE memory_entries SET tags = $1, last_update_time = $2 WHERE actor_id = $3 AND vault_id = $4 AND memory_id = $5 AND entry_id = $6 RETURNING *",
        )
        .bind(&tags)
        .bind(now)
        .bind(actor_id)
        .bind(vault_id)
        .bind(memory_id)
        .bind(entry_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| store_err("update entry tags", e))?;
        row_to_entry(&row)
    }

    async fn update_entry_summary(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        entry_id: &str,
        summary: String,
    ) -> Result<MemoryEntry, MemoryError> {
        let current = self.get_entry(actor_id, vault_id, memory_id, entry_id).await?;
        if current.is_corrected() {
            return Err(MemoryError::already_corrected(entry_id));
        }

        let now = Utc::now();
        let row = sqlx::query(
            "UPDATE memory_entries SET summary = $1, last_update_time = $2 WHERE actor_id = $3 AND vault_id = $4 AND memory_id = $5 AND entry_id = $6 RETURNING *",
        )
        .bind(&summary)
        .bind(now)
        .bind(actor_id)
        .bind(vault_id)
        .bind(memory_id)
        .bind(entry_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| store_err("update entry summary", e))?;
        row_to_entry(&row)
    }

    async fn correct_entry(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        original_entry_id: &str,
        corrected: MemoryEntry,
        reason: String,
    ) -> Result<(MemoryEntry, MemoryEntry), MemoryError> {
        let mut tx = self.pool.begin().await.map_err(|e| store_err("begin correct_entry", e))?;

        let original_row = sqlx::query(
            "SELECT * FROM memory_entries WHERE actor_id = $1 AND vault_id = $2 AND memory_id = $3 AND entry_id = $4 FOR UPDATE",
        )
        .bind(actor_id)
        .bind(vault_id)
        .bind(memory_id)
        .bind(original_entry_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| store_err("lock original entry", e))?
        .ok_or_else(|| MemoryError::not_found("entry", original_entry_id))?;
        let original = row_to_entry(&original_row)?;
        if original.is_corrected() {
            return Err(MemoryError::already_corrected(original_entry_id));
        }

        sqlx::query(
            r#"
            INSERT INTO memory_entries (
                actor_id, vault_id, memory_id, entry_id, creation_time,
                raw_entry, summary, metadata, tags, expiration_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&corrected.actor_id)
        .bind(&corrected.vault_id)
        .bind(&corrected.memory_id)
        .bind(&corrected.entry_id)
        .bind(corrected.creation_time)
        .bind(&corrected.raw_entry)
        .bind(&corrected.summary)
        .bind(&corrected.metadata)
        .bind(&corrected.tags)
        .bind(corrected.expiration_time)
        .execute(&mut *tx)
        .await
        .map_err(|e| store_err("insert corrected entry", e))?;

        let text = corrected
            .summary
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| corrected.raw_entry.clone());
        insert_outbox_row(
            &mut tx,
            OutboxOp::UpsertEntry,
            &corrected.entry_id,
            &corrected.actor_id,
            &corrected.vault_id,
            &corrected.memory_id,
            Some(&text),
            Some(corrected.creation_time),
        )
        .await?;

        let correction_time = Utc::now();
        let updated_original_row = sqlx::query(
            r#"
            UPDATE memory_entries
            SET correction_time = $1, corrected_entry_memory_id = $2,
                corrected_entry_creation_time = $3, correction_reason = $4
            WHERE actor_id = $5 AND vault_id = $6 AND memory_id = $7 AND entry_id = $8
            RETURNING *
            "#,
        )
        .bind(correction_time)
        .bind(&corrected.memory_id)
        .bind(corrected.creation_time)
        .bind(&reason)
        .bind(actor_id)
        .bind(vault_id)
        .bind(memory_id)
        .bind(original_entry_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| store_err("mark original entry corrected", e))?;
        let updated_original = row_to_entry(&updated_original_row)?;

        tx.commit().await.map_err(|e| store_err("commit correct_entry", e))?;
        Ok((updated_original, corrected))
    }

    async fn delete_entry(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        entry_id: &str,
    ) -> Result<(), MemoryError> {
        let mut tx = self.pool.begin().await.map_err(|e| store_err("begin delete_entry", e))?;

        let result = sqlx::query(
            "DELETE FROM memory_entries WHERE actor_id = $1 AND vault_id = $2 AND memory_id = $3 AND entry_id = $4",
        )
        .bind(actor_id)
        .bind(vault_id)
        .bind(memory_id)
        .bind(entry_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| store_err("delete entry", e))?;
        if result.rows_affected() == 0 {
            return Err(MemoryError::not_found("entry", entry_id));
        }

        insert_outbox_row(
            &mut tx,
            OutboxOp::DeleteEntry,
            entry_id,
            actor_id,
            vault_id,
            memory_id,
            None,
            None,
        )
        .await?;

        tx.commit().await.map_err(|e| store_err("commit delete_entry", e))?;
        Ok(())
    }

    async fn put_context(&self, context: MemoryContext) -> Result<MemoryContext, MemoryError> {
        let mut tx = self.pool.begin().await.map_err(|e| store_err("begin put_context", e))?;

        let memory_exists = sqlx::query(
            "SELECT 1 FROM memory_memories WHERE actor_id = $1 AND vault_id = $2 AND memory_id = $3",
        )
        .bind(&context.actor_id)
        .bind(&context.vault_id)
        .bind(&context.memory_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| store_err("check memory exists", e))?;
        if memory_exists.is_none() {
            return Err(MemoryError::not_found("memory", context.memory_id.clone()));
        }

        sqlx::query(
            "INSERT INTO memory_contexts (actor_id, vault_id, memory_id, context_id, creation_time, document) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&context.actor_id)
        .bind(&context.vault_id)
        .bind(&context.memory_id)
        .bind(&context.context_id)
        .bind(context.creation_time)
        .bind(&context.document)
        .execute(&mut *tx)
        .await
        .map_err(|e| store_err("insert context", e))?;

        insert_outbox_row(
            &mut tx,
            OutboxOp::UpsertContext,
            &context.context_id,
            &context.actor_id,
            &context.vault_id,
            &context.memory_id,
            Some(&context.document),
            Some(context.creation_time),
        )
        .await?;

        tx.commit().await.map_err(|e| store_err("commit put_context", e))?;
        Ok(context)
    }

    async fn latest_context(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
    ) -> Result<MemoryContext, MemoryError> {
        let row = sqlx::query(
            "SELECT * FROM memory_contexts WHERE actor_id = $1 AND vault_id = $2 AND memory_id = $3 ORDER BY creation_time DESC LIMIT 1",
        )
        .bind(actor_id)
        .bind(vault_id)
        .bind(memory_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_err("get latest context", e))?
        .ok_or_else(|| MemoryError::not_found("context", memory_id))?;
        row_to_context(&row)
    }

    async fn delete_context(
        &self,
        actor_id: &str,
        vault_id: &str,
        memory_id: &str,
        context_id: &str,
    ) -> Result<(), MemoryError> {
        let mut tx = self.pool.begin().await.map_err(|e| store_err("begin delete_context", e))?;

        let result = sqlx::query(
            "DELETE FROM memory_contexts WHERE actor_id = $1 AND vault_id = $2 AND memory_id = $3 AND context_id = $4",
        )
        .bind(actor_id)
        .bind(vault_id)
        .bind(memory_id)
        .bind(context_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| store_err("delete context", e))?;
        if result.rows_affected() == 0 {
            return Err(MemoryError::not_found("context", context_id));
        }

        insert_outbox_row(
            &mut tx,
            OutboxOp::DeleteContext,
            context_id,
            actor_id,
            vault_id,
            memory_id,
            None,
            None,
        )
        .await?;

        tx.commit().await.map_err(|e| store_err("commit delete_context", e))?;
        Ok(())
    }

    /// Leases up to `batch_size` ready rows with `FOR UPDATE SKIP LOCKED` so
    /// concurrent worker replicas never double-handle a row.
    async fn lease_outbox_batch(&self, batch_size: usize) -> Result<Vec<OutboxRow>, MemoryError> {
        let mut tx = self.pool.begin().await.map_err(|e| store_err("begin lease_outbox_batch", e))?;
        let now = Utc::now();

        let rows = sqlx::query(
            "SELECT * FROM memory_outbox WHERE status = 'pending' AND next_attempt_at <= $1 ORDER BY id ASC LIMIT $2 FOR UPDATE SKIP LOCKED",
        )
        .bind(now)
        .bind(batch_size as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| store_err("lease outbox batch", e))?;

        let leased: Result<Vec<OutboxRow>, MemoryError> = rows.iter().map(row_to_outbox).collect();
        let leased = leased?;

        if !leased.is_empty() {
            let ids: Vec<i64> = leased.iter().map(|row| row.id).collect();
            let lease_until = now + Duration::seconds(OUTBOX_LEASE_SECONDS);
            sqlx::query("UPDATE memory_outbox SET next_attempt_at = $1, updated_at = $2 WHERE id = ANY($3)")
                .bind(lease_until)
                .bind(now)
                .bind(&ids)
                .execute(&mut *tx)
                .await
                .map_err(|e| store_err("bump outbox lease", e))?;
        }

        tx.commit().await.map_err(|e| store_err("commit lease_outbox_batch", e))?;
        Ok(leased)
    }

    async fn mark_outbox_done(&self, id: i64) -> Result<(), MemoryError> {
        let now = Utc::now();
        sqlx::query("UPDATE memory_outbox SET status = 'done', updated_at = $1 WHERE id = $2")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| store_err("mark outbox done", e))?;
        Ok(())
    }

    async fn mark_outbox_failed(&self, id: i64, backoff: Duration) -> Result<(), MemoryError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE memory_outbox SET attempt_count = attempt_count + 1, next_attempt_at = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(now + backoff)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("mark outbox failed", e))?;
        Ok(())
    }

    async fn oldest_pending_outbox_age(&self) -> Result<Option<Duration>, MemoryError> {
        let row = sqlx::query(
            "SELECT MIN(created_at) AS oldest FROM memory_outbox WHERE status = 'pending'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| store_err("oldest pending outbox age", e))?;
        let oldest: Option<DateTime<Utc>> =
            row.try_get("oldest").map_err(|e| store_err("decode oldest pending", e))?;
        Ok(oldest.map(|ts| Utc::now() - ts))
    }

    async fn ping(&self) -> Result<(), MemoryError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| store_err("ping", e))?;
        Ok(())
    }
}
