//! Repository capability for the shared agent table.
//!
//! Every operation runs inside an explicit transaction. The pulse engine opens
//! one short transaction per phase, so a store must make committed writes of
//! one transaction visible to transactions begun afterwards, and must discard
//! uncommitted work when a transaction is dropped.

use async_trait::async_trait;

use super::{Agent, AgentId, NewAgent};
use crate::error::StoreError;

/// A store that can open transactions over the agent table.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn begin_agents(&self) -> Result<Box<dyn AgentTransaction>, StoreError>;
}

/// One transaction over the agent table. Dropping without `commit` rolls back.
#[async_trait]
pub trait AgentTransaction: Send {
    /// All agents, ordered by id. Every agent computes its decisions from
    /// this exact ordering, so it must be stable.
    async fn find_all_ordered_by_id(&mut self) -> Result<Vec<Agent>, StoreError>;

    async fn find(&mut self, id: AgentId) -> Result<Option<Agent>, StoreError>;

    /// Inserts a new agent and returns the id the store assigned.
    async fn create(&mut self, agent: NewAgent) -> Result<AgentId, StoreError>;

    async fn update(&mut self, agent: &Agent) -> Result<(), StoreError>;

    /// Deletes the given agents; missing ids are ignored.
    ///
    /// Returns the number of rows actually removed.
    async fn delete(&mut self, ids: &[AgentId]) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
