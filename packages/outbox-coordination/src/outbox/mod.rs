//! Outbox events: durable, pending indexing work.
//!
//! Producers insert one row per changed entity in the same transaction as the
//! change itself. Event processors later lock, process and then delete or
//! reschedule those rows.

mod loader;
mod routing;
mod updater;

pub use loader::OutboxEventLoader;
pub use routing::{routing_hash, RangeFunction, RoutingRange, ShardEventQuery, UniformHashRanges};
pub use updater::{OutboxEventUpdater, ProcessingOutcome, UpdateReport};

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::StoreError;
use crate::id::Id;

/// Failures allowed before an event is aborted.
pub const MAX_RETRIES: i32 = 3;

pub type OutboxEventId = Id<OutboxEvent>;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "outbox_event_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutboxEventStatus {
    /// Waiting to be processed, possibly after a retry delay.
    Pending,
    /// Failed too many times. Kept for inspection, never picked up again.
    Aborted,
}

/// Identifies the entity an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityReference {
    pub entity_name: String,
    pub entity_id: String,
}

impl EntityReference {
    pub fn new(entity_name: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_name, self.entity_id)
    }
}

/// A persisted outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct OutboxEvent {
    pub id: OutboxEventId,
    pub entity_name: String,
    pub entity_id: String,
    /// Shard routing key; see [`routing_hash`].
    pub routing_hash: i32,
    pub payload: serde_json::Value,
    pub status: OutboxEventStatus,
    pub retries: i32,
    pub process_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub fn entity_reference(&self) -> EntityReference {
        EntityReference::new(self.entity_name.clone(), self.entity_id.clone())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxEventStatus::Pending && self.process_after <= now
    }
}

/// Values for inserting an outbox row.
///
/// The routing hash defaults to the hash of the entity id, so every event of
/// one entity lands in the same shard.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewOutboxEvent {
    pub entity_name: String,
    pub entity_id: String,
    #[builder(default)]
    pub payload: serde_json::Value,
    /// Overrides the key hashed for routing.
    #[builder(default, setter(strip_option))]
    pub routing_key: Option<String>,
    /// Earliest processing time; "immediately" when unset.
    #[builder(default, setter(strip_option))]
    pub process_after: Option<DateTime<Utc>>,
}

impl NewOutboxEvent {
    pub fn routing_hash(&self) -> i32 {
        routing_hash(self.routing_key.as_deref().unwrap_or(&self.entity_id))
    }
}

// ============================================================================
// Store capability
// ============================================================================

/// How the loader locks rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Rows locked elsewhere are silently left out.
    SkipLocked,
    /// Rows locked elsewhere make the whole batch fail with contention.
    Exclusive,
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn begin_outbox(&self) -> Result<Box<dyn OutboxTransaction>, StoreError>;

    /// Whether the backend can skip rows locked by other transactions.
    fn supports_skip_locked(&self) -> bool;
}

/// One transaction over the outbox table. Dropping without `commit` rolls
/// back and releases every lock taken.
#[async_trait]
pub trait OutboxTransaction: Send {
    async fn insert(&mut self, event: NewOutboxEvent) -> Result<OutboxEventId, StoreError>;

    /// Ids of pending events due at `now` whose routing hash lies in `range`,
    /// ordered by process-after then id.
    async fn find_due(
        &mut self,
        range: RoutingRange,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OutboxEventId>, StoreError>;

    /// Locks the given pending events for the rest of the transaction.
    ///
    /// Missing or aborted ids are left out. With [`LockMode::Exclusive`], a
    /// row held by another transaction fails with
    /// [`StoreError::LockContention`].
    async fn lock(
        &mut self,
        ids: &[OutboxEventId],
        mode: LockMode,
    ) -> Result<Vec<OutboxEvent>, StoreError>;

    /// Persists status, retries and process-after of an event.
    async fn update(&mut self, event: &OutboxEvent) -> Result<(), StoreError>;

    async fn delete(&mut self, ids: &[OutboxEventId]) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_reference_display() {
        assert_eq!(EntityReference::new("Book", "42").to_string(), "Book#42");
    }

    #[test]
    fn routing_hash_follows_entity_id_by_default() {
        let event = NewOutboxEvent::builder()
            .entity_name("Book")
            .entity_id("42")
            .build();
        assert_eq!(event.routing_hash(), routing_hash("42"));

        let routed = NewOutboxEvent::builder()
            .entity_name("Book")
            .entity_id("42")
            .routing_key("library-7")
            .build();
        assert_eq!(routed.routing_hash(), routing_hash("library-7"));
    }

    #[test]
    fn aborted_events_are_never_due() {
        let now = Utc::now();
        let mut event = OutboxEvent {
            id: OutboxEventId::new(),
            entity_name: "Book".into(),
            entity_id: "1".into(),
            routing_hash: 0,
            payload: serde_json::Value::Null,
            status: OutboxEventStatus::Pending,
            retries: 0,
            process_after: now,
            created_at: now,
        };
        assert!(event.is_due(now));
        event.status = OutboxEventStatus::Aborted;
        assert!(!event.is_due(now));
    }
}
