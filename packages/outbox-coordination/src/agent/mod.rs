//! Agent records: one row per live (or recently live) worker process.
//!
//! An agent row is only ever mutated by its owner. Peers read it every pulse
//! and may delete it once its expiration has elapsed, but never change its
//! state or assignment.

mod persister;
mod repository;

pub use persister::AgentPersister;
pub use repository::{AgentStore, AgentTransaction};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::id::Id;

pub type AgentId = Id<Agent>;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "agent_kind", rename_all = "snake_case")]
pub enum AgentKind {
    /// Queue consumer whose shard is fixed by configuration.
    EventProcessingStaticSharding,
    /// Queue consumer whose shard is derived from the roster.
    EventProcessingDynamicSharding,
    /// Bulk rebuild; needs every queue consumer suspended.
    MassIndexing,
}

impl AgentKind {
    pub fn is_event_processing(&self) -> bool {
        matches!(
            self,
            AgentKind::EventProcessingStaticSharding | AgentKind::EventProcessingDynamicSharding
        )
    }
}

/// Agent lifecycle state.
///
/// Older deployments called the intermediate state "rebalancing"; it has the
/// same meaning as `Waiting` and is accepted when deserializing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "agent_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Suspended,
    #[serde(alias = "rebalancing")]
    Waiting,
    Running,
}

// ============================================================================
// Shard assignment
// ============================================================================

/// Largest shard total an agent may declare.
///
/// Every agent lays out the whole target in memory, so the total is bounded
/// well below what the storage columns could hold.
pub const MAX_SHARD_TOTAL: u32 = 4096;

/// A shard: index `index` out of `total` disjoint partitions of the outbox.
///
/// `index < total` always holds. Assignments built with [`new`](Self::new)
/// also respect [`MAX_SHARD_TOTAL`]; rows read back from a store are only
/// checked for the index, and the cluster target rejects oversized totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ShardAssignment {
    total: u32,
    index: u32,
}

impl ShardAssignment {
    pub fn new(total: u32, index: u32) -> Result<Self, ConfigError> {
        if total > MAX_SHARD_TOTAL {
            return Err(ConfigError::ShardTotalTooLarge {
                total,
                max: MAX_SHARD_TOTAL,
            });
        }
        Self::unbounded(total, index)
    }

    /// Checks only `index < total`. For rows written by other processes,
    /// which may not share this process's limits.
    pub(crate) fn unbounded(total: u32, index: u32) -> Result<Self, ConfigError> {
        if index >= total {
            return Err(ConfigError::InvalidShardAssignment { total, index });
        }
        Ok(Self { total, index })
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for ShardAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard {} of {}", self.index, self.total)
    }
}

// ============================================================================
// Agent
// ============================================================================

/// A persisted agent row.
///
/// Read-phase snapshots and write-phase handles are both plain `Agent`
/// values; the write phase always reloads its own copy inside the write
/// transaction instead of reusing a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Agent {
    pub id: AgentId,
    pub kind: AgentKind,
    pub name: String,
    pub state: AgentState,
    pub expiration: DateTime<Utc>,
    pub shard_assignment: Option<ShardAssignment>,
}

impl Agent {
    /// Whether a peer may purge this row.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration < now
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {:?}, {:?}", self.name, self.id, self.kind, self.state)?;
        if let Some(assignment) = self.shard_assignment {
            write!(f, ", {}", assignment)?;
        }
        write!(f, ", expires {})", self.expiration.to_rfc3339())
    }
}

/// Values for inserting a new agent row. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAgent {
    pub kind: AgentKind,
    pub name: String,
    pub state: AgentState,
    pub expiration: DateTime<Utc>,
    pub shard_assignment: Option<ShardAssignment>,
}

impl NewAgent {
    pub fn into_agent(self, id: AgentId) -> Agent {
        Agent {
            id,
            kind: self.kind,
            name: self.name,
            state: self.state,
            expiration: self.expiration,
            shard_assignment: self.shard_assignment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn shard_index_must_be_below_total() {
        assert!(ShardAssignment::new(3, 2).is_ok());
        assert!(matches!(
            ShardAssignment::new(3, 3),
            Err(ConfigError::InvalidShardAssignment { total: 3, index: 3 })
        ));
        assert!(ShardAssignment::new(0, 0).is_err());
    }

    #[test]
    fn shard_total_is_bounded() {
        assert!(ShardAssignment::new(MAX_SHARD_TOTAL, MAX_SHARD_TOTAL - 1).is_ok());
        assert!(matches!(
            ShardAssignment::new(u32::MAX, 0),
            Err(ConfigError::ShardTotalTooLarge { total: u32::MAX, max: MAX_SHARD_TOTAL })
        ));
        assert!(ShardAssignment::unbounded(u32::MAX, 0).is_ok());
        assert!(ShardAssignment::unbounded(3, 3).is_err());
    }

    #[test]
    fn only_queue_consumers_are_event_processing() {
        assert!(AgentKind::EventProcessingStaticSharding.is_event_processing());
        assert!(AgentKind::EventProcessingDynamicSharding.is_event_processing());
        assert!(!AgentKind::MassIndexing.is_event_processing());
    }

    #[test]
    fn expiration_is_strictly_in_the_past() {
        let now = Utc::now();
        let agent = NewAgent {
            kind: AgentKind::MassIndexing,
            name: "rebuild".into(),
            state: AgentState::Suspended,
            expiration: now,
            shard_assignment: None,
        }
        .into_agent(AgentId::new());

        assert!(!agent.is_expired(now));
        assert!(agent.is_expired(now + TimeDelta::milliseconds(1)));
    }

    #[test]
    fn rebalancing_reads_as_waiting() {
        let state: AgentState = serde_json::from_str("\"rebalancing\"").unwrap();
        assert_eq!(state, AgentState::Waiting);
    }

    #[test]
    fn new_agents_start_suspended_by_default() {
        assert_eq!(AgentState::default(), AgentState::Suspended);
    }
}
