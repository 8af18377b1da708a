//! Pulse engine: one heartbeat of an agent.
//!
//! A pulse is a fixed sequence of short transactions:
//!
//! 1. register self if this process has no agent row yet (own transaction)
//! 2. read the whole roster, ordered by id (own transaction)
//! 3. purge expired peers; if any were purged, stop here and retry soon
//! 4. let the policy decide, from the roster as persisted
//! 5. reload self, extend its expiration, apply the decision (own transaction)
//!
//! The engine knows nothing about sharding or exclusivity; that lives in the
//! [`PulsePolicy`] implementations:
//! [`EventProcessorPolicy`] and [`MassIndexerPolicy`].

mod cluster_target;
mod event_processor;
mod mass_indexer;

pub use cluster_target::{ClusterDescriptor, ClusterTarget};
pub use event_processor::{EventProcessingInstructions, EventProcessorPolicy, Sharding};
pub use mass_indexer::{MassIndexerPolicy, MassIndexingInstructions};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::agent::{
    Agent, AgentId, AgentKind, AgentPersister, AgentState, AgentStore, ShardAssignment,
};
use crate::clock::Clock;
use crate::config::PulseConfig;
use crate::error::PulseError;
use crate::failure::FailureHandler;

// ============================================================================
// Policy seam
// ============================================================================

/// Mutation a policy asks the engine to apply to self's row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    Suspend,
    /// Wait, optionally (re)assigning the shard.
    Wait(Option<ShardAssignment>),
    /// Run, optionally (re)assigning the shard.
    Run(Option<ShardAssignment>),
}

impl WriteAction {
    pub fn state(&self) -> AgentState {
        match self {
            WriteAction::Suspend => AgentState::Suspended,
            WriteAction::Wait(_) => AgentState::Waiting,
            WriteAction::Run(_) => AgentState::Running,
        }
    }

    /// Applies the state, and the assignment when one is given.
    pub fn apply(&self, agent: &mut Agent) {
        agent.state = self.state();
        if let WriteAction::Wait(Some(assignment)) | WriteAction::Run(Some(assignment)) = self {
            agent.shard_assignment = Some(*assignment);
        }
    }
}

/// What a policy returns from [`PulsePolicy::decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision<I> {
    pub action: WriteAction,
    pub instructions: I,
}

/// Everything a policy may look at while deciding.
pub struct PulseInput<'a> {
    /// All agents as persisted, ordered by id. Expired peers are already gone.
    pub roster: &'a [Agent],
    /// Self as persisted in `roster`.
    pub current_self: &'a Agent,
    pub now: DateTime<Utc>,
    pub config: &'a PulseConfig,
    pub failure_handler: &'a dyn FailureHandler,
}

impl PulseInput<'_> {
    /// The roster without self.
    pub fn peers(&self) -> impl Iterator<Item = &Agent> {
        let self_id = self.current_self.id;
        self.roster.iter().filter(move |agent| agent.id != self_id)
    }

    pub fn find(&self, id: AgentId) -> Option<&Agent> {
        self.roster.iter().find(|agent| agent.id == id)
    }

    pub fn after_polling_interval(&self) -> DateTime<Utc> {
        self.now + self.config.polling_delta()
    }

    pub fn after_pulse_interval(&self) -> DateTime<Utc> {
        self.now + self.config.pulse_delta()
    }
}

/// The per-kind state machine plugged into a [`PulseEngine`].
///
/// `decide` must be deterministic given its input: every agent runs the same
/// computation over the same roster and must reach compatible conclusions.
pub trait PulsePolicy: Send {
    type Instructions: Send;

    fn kind(&self) -> AgentKind;

    /// Assignment persisted at registration, for statically sharded agents.
    fn static_assignment(&self) -> Option<ShardAssignment> {
        None
    }

    fn decide(&mut self, input: &PulseInput<'_>) -> Decision<Self::Instructions>;

    /// Instructions for a pulse that stopped early and granted nothing.
    fn instruct_retry(&self, next_pulse: DateTime<Utc>) -> Self::Instructions;
}

// ============================================================================
// Engine
// ============================================================================

/// Shared capabilities every agent of a process uses.
#[derive(Clone)]
pub struct PulseContext {
    pub agents: Arc<dyn AgentStore>,
    pub clock: Arc<dyn Clock>,
    pub failure_handler: Arc<dyn FailureHandler>,
}

pub struct PulseEngine<P: PulsePolicy> {
    persister: AgentPersister,
    policy: P,
    context: PulseContext,
    config: PulseConfig,
}

impl<P: PulsePolicy> PulseEngine<P> {
    pub fn new(name: impl Into<String>, policy: P, context: PulseContext, config: PulseConfig) -> Self {
        let persister = AgentPersister::new(policy.kind(), name, policy.static_assignment());
        Self {
            persister,
            policy,
            context,
            config,
        }
    }

    pub fn self_id(&self) -> Option<AgentId> {
        self.persister.self_id()
    }

    pub fn name(&self) -> &str {
        self.persister.name()
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn config(&self) -> &PulseConfig {
        &self.config
    }

    pub fn context(&self) -> &PulseContext {
        &self.context
    }

    /// Runs one pulse and returns the policy's instructions.
    pub async fn pulse(&mut self) -> Result<P::Instructions, PulseError> {
        let store = self.context.agents.as_ref();
        let now = self.context.clock.now();

        let (self_id, created) = self
            .persister
            .ensure_registered(store, now, self.config.expiration_delta())
            .await?;

        // Read phase
        let mut tx = store.begin_agents().await?;
        let roster = tx.find_all_ordered_by_id().await?;
        tx.commit().await?;

        let Some(current_self) = roster.iter().find(|agent| agent.id == self_id) else {
            self.persister.forget();
            return Err(PulseError::SelfNotFound { id: self_id });
        };

        let expired: Vec<AgentId> = roster
            .iter()
            .filter(|agent| agent.id != self_id && agent.is_expired(now))
            .map(|agent| agent.id)
            .collect();
        if !expired.is_empty() {
            let mut tx = store.begin_agents().await?;
            let removed = tx.delete(&expired).await?;
            tx.commit().await?;

            info!(
                agent_id = %self_id,
                agent_name = %self.persister.name(),
                expired = ?expired,
                removed,
                "removed expired agents"
            );
            return Ok(self.policy.instruct_retry(now + self.config.polling_delta()));
        }

        let decision = self.policy.decide(&PulseInput {
            roster: &roster,
            current_self,
            now,
            config: &self.config,
            failure_handler: self.context.failure_handler.as_ref(),
        });
        let previous_state = current_self.state;

        // Write phase: never reuse the read-phase snapshot.
        let mut tx = store.begin_agents().await?;
        let Some(mut agent) = tx.find(self_id).await? else {
            drop(tx);
            self.persister.forget();
            return Err(PulseError::SelfNotFound { id: self_id });
        };
        agent.expiration = now + self.config.expiration_delta();
        decision.action.apply(&mut agent);
        tx.update(&agent).await?;
        tx.commit().await?;

        if previous_state != agent.state {
            info!(
                agent_id = %self_id,
                agent_name = %agent.name,
                from = ?previous_state,
                to = ?agent.state,
                shard = ?agent.shard_assignment,
                "agent state changed"
            );
        } else {
            debug!(
                agent_id = %self_id,
                state = ?agent.state,
                created,
                roster = roster.len(),
                "pulse"
            );
        }

        Ok(decision.instructions)
    }

    /// Deletes self from the agent table. Safe to call repeatedly.
    pub async fn leave(&mut self) -> Result<(), PulseError> {
        self.persister.leave(self.context.agents.as_ref()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::NewAgent;

    fn agent(state: AgentState, shard: Option<ShardAssignment>) -> Agent {
        NewAgent {
            kind: AgentKind::EventProcessingDynamicSharding,
            name: "worker".into(),
            state,
            expiration: Utc::now(),
            shard_assignment: shard,
        }
        .into_agent(AgentId::new())
    }

    #[test]
    fn suspend_keeps_the_assignment() {
        let shard = ShardAssignment::new(2, 1).unwrap();
        let mut agent = agent(AgentState::Running, Some(shard));
        WriteAction::Suspend.apply(&mut agent);
        assert_eq!(agent.state, AgentState::Suspended);
        assert_eq!(agent.shard_assignment, Some(shard));
    }

    #[test]
    fn wait_and_run_replace_the_assignment_when_given() {
        let old = ShardAssignment::new(2, 1).unwrap();
        let new = ShardAssignment::new(3, 0).unwrap();
        let mut agent = agent(AgentState::Suspended, Some(old));

        WriteAction::Wait(Some(new)).apply(&mut agent);
        assert_eq!(agent.state, AgentState::Waiting);
        assert_eq!(agent.shard_assignment, Some(new));

        WriteAction::Run(None).apply(&mut agent);
        assert_eq!(agent.state, AgentState::Running);
        assert_eq!(agent.shard_assignment, Some(new));
    }
}
