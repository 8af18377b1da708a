//! # Outbox coordination
//!
//! Leaderless coordination of outbox-polling index agents. A fleet of
//! processes drains a shared outbox table of pending indexing work without
//! leader election and without talking to each other: every agent pulses
//! against a small shared agent table and derives the same shard layout from
//! it.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler (runner / your own loop)
//!     │
//!     ▼ pulse()
//! PulseEngine ──► register self ──► read roster ──► purge expired peers
//!     │
//!     ▼ decide()
//! PulsePolicy
//!     ├─► EventProcessorPolicy ─► ClusterTarget::compute(roster)
//!     └─► MassIndexerPolicy
//!     │
//!     ▼ write self, commit
//! Instructions ─► next pulse time (+ shard event query while RUNNING)
//!     │
//!     ▼
//! OutboxEventLoader (lock, skip-locked) ─► process ─► OutboxEventUpdater
//! ```
//!
//! ## Key Invariants
//!
//! 1. **No double ownership** - two running agents never hold the same shard
//! 2. **No split brain** - an agent never runs on its first pulse
//! 3. **Mutual exclusion** - a running mass indexer implies suspended event processors
//! 4. **Owner-only writes** - an agent only updates its own row; peers may only
//!    delete it once expired
//! 5. **Bounded retries** - an event failing [`MAX_RETRIES`] times is aborted,
//!    never dropped
//!
//! ## Guarantees
//!
//! - **At-least-once processing**: processors must be idempotent
//! - **Optimistic coordination**: no lock is held across pulses
//! - **Pulse cadence**: rebalancing never happens faster than the configured
//!   intervals

pub mod agent;
pub mod clock;
pub mod config;
pub mod error;
pub mod failure;
pub mod id;
pub mod outbox;
pub mod postgres;
pub mod pulse;
pub mod runner;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;



// Re-export agent types
pub use agent::{
    Agent, AgentId, AgentKind, AgentPersister, AgentState, AgentStore, AgentTransaction,
    NewAgent, ShardAssignment, MAX_SHARD_TOTAL,
};

// Re-export injected capabilities
pub use clock::{Clock, SystemClock};
pub use failure::{FailureHandler, FailureReport, TracingFailureHandler};

// Re-export configuration
pub use config::{Config, ProcessingConfig, PulseConfig, ShardingConfig};

// Re-export error types
pub use error::{ClusterTargetError, ConfigError, PulseError, StoreError};

// Re-export outbox types
pub use outbox::{
    routing_hash, EntityReference, LockMode, NewOutboxEvent, OutboxEvent, OutboxEventId,
    OutboxEventLoader, OutboxEventStatus, OutboxEventUpdater, OutboxStore, OutboxTransaction,
    ProcessingOutcome, RangeFunction, RoutingRange, ShardEventQuery, UniformHashRanges,
    UpdateReport, MAX_RETRIES,
};

// Re-export pulse types
pub use pulse::{
    ClusterDescriptor, ClusterTarget, Decision, EventProcessingInstructions,
    EventProcessorPolicy, MassIndexerPolicy, MassIndexingInstructions, PulseContext, PulseEngine,
    PulseInput, PulsePolicy, Sharding, WriteAction,
};

// Re-export store backends and runners
pub use postgres::PgStore;
pub use runner::{EventBatchProcessor, EventProcessorRunner, MassIndexerAgent};

// Re-export commonly used external types
pub use async_trait::async_trait;
