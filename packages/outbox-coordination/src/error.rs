//! Structured error types for coordination.
//!
//! `anyhow` is the internal transport for backend failures; everything a
//! caller may want to branch on is a typed variant here.
//!
//! - [`StoreError`] separates lock contention (expected, retried silently)
//!   from backend failures (reported).
//! - [`ClusterTargetError`] describes conflicting static sharding
//!   configuration. It is reported through the failure handler, never
//!   propagated out of a pulse.
//! - [`PulseError`] is what a pulse surfaces to its scheduler.
//! - [`ConfigError`] is raised before any agent starts.

use std::time::Duration;

use thiserror::Error;

use crate::agent::{Agent, AgentId};

// =============================================================================
// Store Error
// =============================================================================

/// Errors from the shared coordination store.
///
/// The distinction matters:
/// - [`StoreError::LockContention`] means another agent holds a row lock.
///   The caller treats the affected rows as "not this round".
/// - [`StoreError::Backend`] means the store itself failed (connection,
///   timeout, decoding). It propagates to the scheduler.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A row lock could not be acquired because another transaction holds it.
    #[error("row lock contention")]
    LockContention,

    /// Storage backend failed.
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_contention(&self) -> bool {
        matches!(self, StoreError::LockContention)
    }
}

// =============================================================================
// Cluster Target Error
// =============================================================================

/// Conflicting static shard declarations found in the agent roster.
///
/// Every variant carries the roster it was computed from, so a single
/// failure report is enough to diagnose which processes are misconfigured.
#[derive(Debug, Error)]
pub enum ClusterTargetError {
    #[error(
        "agent {agent} declares {declared} total shards but agent {first} already fixed the total at {expected}; agents: {}",
        format_roster(.roster)
    )]
    TotalShardCountConflict {
        agent: AgentId,
        declared: u32,
        first: AgentId,
        expected: u32,
        roster: Vec<Agent>,
    },

    #[error(
        "agents {first} and {second} both claim shard {index} of {total}; agents: {}",
        format_roster(.roster)
    )]
    ShardIndexConflict {
        first: AgentId,
        second: AgentId,
        index: u32,
        total: u32,
        roster: Vec<Agent>,
    },

    #[error(
        "agent {agent} is statically sharded but has no shard assignment; agents: {}",
        format_roster(.roster)
    )]
    MissingStaticAssignment { agent: AgentId, roster: Vec<Agent> },

    #[error(
        "agent {agent} declares {declared} total shards, above the maximum of {max}; agents: {}",
        format_roster(.roster)
    )]
    ShardTotalTooLarge {
        agent: AgentId,
        declared: u32,
        max: u32,
        roster: Vec<Agent>,
    },
}

impl ClusterTargetError {
    /// Agents whose declarations clash. Stable for as long as the conflict
    /// persists, unlike the roster snapshot.
    pub fn conflicting_agents(&self) -> Vec<AgentId> {
        match self {
            ClusterTargetError::TotalShardCountConflict { agent, first, .. } => vec![*first, *agent],
            ClusterTargetError::ShardIndexConflict { first, second, .. } => vec![*first, *second],
            ClusterTargetError::MissingStaticAssignment { agent, .. }
            | ClusterTargetError::ShardTotalTooLarge { agent, .. } => vec![*agent],
        }
    }
}

fn format_roster(roster: &[Agent]) -> String {
    let entries: Vec<String> = roster.iter().map(|agent| agent.to_string()).collect();
    format!("[{}]", entries.join(", "))
}

// =============================================================================
// Pulse Error
// =============================================================================

/// Unrecoverable pulse failures, surfaced to the scheduler.
///
/// Recoverable conditions (conflicts, contention, peers not ready) never
/// show up here; they only delay the next pulse.
#[derive(Debug, Error)]
pub enum PulseError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Self's row vanished: either the insert did not become visible, or a
    /// peer purged it as expired between two phases.
    #[error("agent {id} not found in the agent table")]
    SelfNotFound { id: AgentId },
}

// =============================================================================
// Config Error
// =============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required ordering: polling <= pulse interval <= pulse expiration / 3.
    #[error(
        "invalid pulse intervals: polling {polling:?}, pulse {pulse:?}, expiration {expiration:?} \
         (required: polling <= pulse <= expiration / 3)"
    )]
    InvalidIntervals {
        polling: Duration,
        pulse: Duration,
        expiration: Duration,
    },

    #[error("invalid shard assignment: index {index} of {total}")]
    InvalidShardAssignment { total: u32, index: u32 },

    #[error("shard total {total} exceeds the maximum of {max}")]
    ShardTotalTooLarge { total: u32, max: u32 },

    #[error("invalid static sharding: {0}")]
    InvalidStaticSharding(String),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_is_distinguishable_from_backend_failure() {
        assert!(StoreError::LockContention.is_contention());
        assert!(!StoreError::Backend(anyhow::anyhow!("connection reset")).is_contention());
    }

    #[test]
    fn backend_error_keeps_the_cause() {
        let err = StoreError::from(anyhow::anyhow!("connection reset"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn pulse_error_wraps_store_error() {
        let err: PulseError = StoreError::LockContention.into();
        assert!(matches!(err, PulseError::Store(StoreError::LockContention)));
    }

    #[test]
    fn invalid_intervals_mentions_the_rule() {
        let err = ConfigError::InvalidIntervals {
            polling: Duration::from_millis(100),
            pulse: Duration::from_secs(20),
            expiration: Duration::from_secs(30),
        };
        assert!(err.to_string().contains("expiration / 3"));
    }
}
