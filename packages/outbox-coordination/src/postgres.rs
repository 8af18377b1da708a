//! PostgreSQL implementation of the agent and outbox stores.
//!
//! Each transaction wraps a `sqlx::Transaction` taken from the pool. Dropping
//! it without committing rolls back, which is what the pulse engine relies
//! on when a phase fails half-way.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::agent::{
    Agent, AgentId, AgentKind, AgentState, AgentStore, AgentTransaction, NewAgent,
    ShardAssignment,
};
use crate::error::StoreError;
use crate::id::Id;
use crate::outbox::{
    LockMode, NewOutboxEvent, OutboxEvent, OutboxEventId, OutboxStore, OutboxTransaction,
    RoutingRange,
};

/// SQLSTATEs meaning "another transaction got there first":
/// lock_not_available, deadlock_detected, serialization_failure.
const CONTENTION_CODES: [&str; 3] = ["55P03", "40P01", "40001"];

fn store_error(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db
            .code()
            .is_some_and(|code| CONTENTION_CODES.iter().any(|c| *c == code))
        {
            return StoreError::LockContention;
        }
    }
    StoreError::Backend(e.into())
}

fn uuids<T>(ids: &[Id<T>]) -> Vec<Uuid> {
    ids.iter().map(|id| id.into_uuid()).collect()
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    skip_locked: bool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            skip_locked: true,
        }
    }

    /// Locks outbox rows with `FOR UPDATE NOWAIT` instead of skipping them.
    pub fn without_skip_locked(mut self) -> Self {
        self.skip_locked = false;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates or upgrades the coordination tables.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool.begin().await.map_err(store_error)
    }
}

// ============================================================================
// Agents
// ============================================================================

#[derive(FromRow)]
struct AgentRow {
    id: AgentId,
    kind: AgentKind,
    name: String,
    state: AgentState,
    expiration: DateTime<Utc>,
    shard_total: Option<i32>,
    shard_index: Option<i32>,
}

impl TryFrom<AgentRow> for Agent {
    type Error = StoreError;

    fn try_from(row: AgentRow) -> Result<Self, Self::Error> {
        let shard_assignment = match (row.shard_total, row.shard_index) {
            (Some(total), Some(index)) => {
                let total = u32::try_from(total).map_err(|e| StoreError::Backend(e.into()))?;
                let index = u32::try_from(index).map_err(|e| StoreError::Backend(e.into()))?;
                // Oversized totals are left to the cluster target to report.
                Some(
                    ShardAssignment::unbounded(total, index)
                        .map_err(|e| StoreError::Backend(e.into()))?,
                )
            }
            _ => None,
        };

        Ok(Agent {
            id: row.id,
            kind: row.kind,
            name: row.name,
            state: row.state,
            expiration: row.expiration,
            shard_assignment,
        })
    }
}

/// `(shard_total, shard_index)` column values. Both are set or neither is.
fn shard_columns(
    assignment: Option<ShardAssignment>,
) -> Result<(Option<i32>, Option<i32>), StoreError> {
    let Some(a) = assignment else {
        return Ok((None, None));
    };
    let total = i32::try_from(a.total())
        .with_context(|| format!("{} does not fit the shard_total column", a))?;
    let index = i32::try_from(a.index())
        .with_context(|| format!("{} does not fit the shard_index column", a))?;
    Ok((Some(total), Some(index)))
}

pub struct PgAgentTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl AgentStore for PgStore {
    async fn begin_agents(&self) -> Result<Box<dyn AgentTransaction>, StoreError> {
        Ok(Box::new(PgAgentTransaction {
            tx: self.begin().await?,
        }))
    }
}

#[async_trait]
impl AgentTransaction for PgAgentTransaction {
    async fn find_all_ordered_by_id(&mut self) -> Result<Vec<Agent>, StoreError> {
        let rows = sqlx::query_as::<_, AgentRow>(
            r#"
            SELECT id, kind, name, state, expiration, shard_total, shard_index
            FROM coordination_agents
            ORDER BY id
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(store_error)?;

        rows.into_iter().map(Agent::try_from).collect()
    }

    async fn find(&mut self, id: AgentId) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query_as::<_, AgentRow>(
            r#"
            SELECT id, kind, name, state, expiration, shard_total, shard_index
            FROM coordination_agents
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(store_error)?;

        row.map(Agent::try_from).transpose()
    }

    async fn create(&mut self, agent: NewAgent) -> Result<AgentId, StoreError> {
        let id = AgentId::new();
        let (shard_total, shard_index) = shard_columns(agent.shard_assignment)?;

        sqlx::query(
            r#"
            INSERT INTO coordination_agents (id, kind, name, state, expiration, shard_total, shard_index)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id)
        .bind(agent.kind)
        .bind(&agent.name)
        .bind(agent.state)
        .bind(agent.expiration)
        .bind(shard_total)
        .bind(shard_index)
        .execute(&mut *self.tx)
        .await
        .map_err(store_error)?;

        Ok(id)
    }

    async fn update(&mut self, agent: &Agent) -> Result<(), StoreError> {
        let (shard_total, shard_index) = shard_columns(agent.shard_assignment)?;

        sqlx::query(
            r#"
            UPDATE coordination_agents
            SET state = $2,
                expiration = $3,
                shard_total = $4,
                shard_index = $5
            WHERE id = $1
            "#,
        )
        .bind(agent.id)
        .bind(agent.state)
        .bind(agent.expiration)
        .bind(shard_total)
        .bind(shard_index)
        .execute(&mut *self.tx)
        .await
        .map_err(store_error)?;

        Ok(())
    }

    async fn delete(&mut self, ids: &[AgentId]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("DELETE FROM coordination_agents WHERE id = ANY($1)")
            .bind(uuids(ids))
            .execute(&mut *self.tx)
            .await
            .map_err(store_error)?;

        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(store_error)
    }
}

// ============================================================================
// Outbox
// ============================================================================

pub struct PgOutboxTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn begin_outbox(&self) -> Result<Box<dyn OutboxTransaction>, StoreError> {
        Ok(Box::new(PgOutboxTransaction {
            tx: self.begin().await?,
        }))
    }

    fn supports_skip_locked(&self) -> bool {
        self.skip_locked
    }
}

#[async_trait]
impl OutboxTransaction for PgOutboxTransaction {
    async fn insert(&mut self, event: NewOutboxEvent) -> Result<OutboxEventId, StoreError> {
        let id = OutboxEventId::new();
        let routing_hash = event.routing_hash();

        sqlx::query(
            r#"
            INSERT INTO outbox_events (id, entity_name, entity_id, routing_hash, payload, process_after)
            VALUES ($1, $2, $3, $4, $5, COALESCE($6, NOW()))
            "#,
        )
        .bind(id)
        .bind(&event.entity_name)
        .bind(&event.entity_id)
        .bind(routing_hash)
        .bind(&event.payload)
        .bind(event.process_after)
        .execute(&mut *self.tx)
        .await
        .map_err(store_error)?;

        Ok(id)
    }

    async fn find_due(
        &mut self,
        range: RoutingRange,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OutboxEventId>, StoreError> {
        sqlx::query_scalar::<_, OutboxEventId>(
            r#"
            SELECT id
            FROM outbox_events
            WHERE status = 'pending'
              AND process_after <= $1
              AND routing_hash BETWEEN $2 AND $3
            ORDER BY process_after, id
            LIMIT $4
            "#,
        )
        .bind(now)
        .bind(range.start)
        .bind(range.end)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(store_error)
    }

    async fn lock(
        &mut self,
        ids: &[OutboxEventId],
        mode: LockMode,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let sql = match mode {
            LockMode::SkipLocked => {
                r#"
                SELECT id, entity_name, entity_id, routing_hash, payload, status, retries,
                       process_after, created_at
                FROM outbox_events
                WHERE id = ANY($1) AND status = 'pending'
                ORDER BY id
                FOR UPDATE SKIP LOCKED
                "#
            }
            LockMode::Exclusive => {
                r#"
                SELECT id, entity_name, entity_id, routing_hash, payload, status, retries,
                       process_after, created_at
                FROM outbox_events
                WHERE id = ANY($1) AND status = 'pending'
                ORDER BY id
                FOR UPDATE NOWAIT
                "#
            }
        };

        sqlx::query_as::<_, OutboxEvent>(sql)
            .bind(uuids(ids))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(store_error)
    }

    async fn update(&mut self, event: &OutboxEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = $2,
                retries = $3,
                process_after = $4
            WHERE id = $1
            "#,
        )
        .bind(event.id)
        .bind(event.status)
        .bind(event.retries)
        .bind(event.process_after)
        .execute(&mut *self.tx)
        .await
        .map_err(store_error)?;

        Ok(())
    }

    async fn delete(&mut self, ids: &[OutboxEventId]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("DELETE FROM outbox_events WHERE id = ANY($1)")
            .bind(uuids(ids))
            .execute(&mut *self.tx)
            .await
            .map_err(store_error)?;

        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(store_error)
    }
}
