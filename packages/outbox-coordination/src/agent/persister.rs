//! Registration and removal of the current process's own agent row.

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info};

use super::{AgentId, AgentKind, AgentState, AgentStore, NewAgent, ShardAssignment};
use crate::error::StoreError;

/// Owns the identity of "self" in the agent table.
///
/// The id is only known after the first registration. If a peer purges the
/// row (because this process failed to pulse in time), [`forget`] drops the
/// id and the next pulse registers a fresh row, which starts out suspended.
///
/// [`forget`]: AgentPersister::forget
#[derive(Debug)]
pub struct AgentPersister {
    kind: AgentKind,
    name: String,
    static_assignment: Option<ShardAssignment>,
    self_id: Option<AgentId>,
}

impl AgentPersister {
    pub fn new(
        kind: AgentKind,
        name: impl Into<String>,
        static_assignment: Option<ShardAssignment>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            static_assignment,
            self_id: None,
        }
    }

    pub fn self_id(&self) -> Option<AgentId> {
        self.self_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    /// Inserts self if not registered yet, committing immediately.
    ///
    /// Returns the self id and whether a new row was created during this call.
    pub async fn ensure_registered(
        &mut self,
        store: &dyn AgentStore,
        now: DateTime<Utc>,
        expiration: TimeDelta,
    ) -> Result<(AgentId, bool), StoreError> {
        if let Some(id) = self.self_id {
            return Ok((id, false));
        }

        let mut tx = store.begin_agents().await?;
        let id = tx
            .create(NewAgent {
                kind: self.kind,
                name: self.name.clone(),
                state: AgentState::Suspended,
                expiration: now + expiration,
                shard_assignment: self.static_assignment,
            })
            .await?;
        tx.commit().await?;

        info!(
            agent_id = %id,
            agent_name = %self.name,
            kind = ?self.kind,
            static_assignment = ?self.static_assignment,
            "registered agent"
        );

        self.self_id = Some(id);
        Ok((id, true))
    }

    /// Drops the remembered id so the next pulse registers again.
    pub fn forget(&mut self) {
        if let Some(id) = self.self_id.take() {
            debug!(agent_id = %id, agent_name = %self.name, "forgetting agent id");
        }
    }

    /// Deletes self in one final transaction. Safe to call repeatedly.
    pub async fn leave(&mut self, store: &dyn AgentStore) -> Result<(), StoreError> {
        let Some(id) = self.self_id.take() else {
            return Ok(());
        };

        let mut tx = store.begin_agents().await?;
        let removed = tx.delete(&[id]).await?;
        tx.commit().await?;

        info!(agent_id = %id, agent_name = %self.name, removed, "agent left the cluster");
        Ok(())
    }
}
