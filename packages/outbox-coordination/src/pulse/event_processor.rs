//! Queue-consumer policy.
//!
//! An event processor goes SUSPENDED → WAITING → RUNNING. It only runs once a
//! pulse observed the whole target layout in place: every slot filled, every
//! member waiting or running with the right shard, every surplus agent
//! suspended. Since a fresh agent starts suspended, no agent runs on its
//! first pulse.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{ClusterTarget, Decision, PulseInput, PulsePolicy, WriteAction};
use crate::agent::{AgentId, AgentKind, AgentState, ShardAssignment};
use crate::failure::FailureReport;
use crate::outbox::{RangeFunction, ShardEventQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharding {
    Dynamic,
    Static(ShardAssignment),
}

/// What an event processor should do until its next pulse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventProcessingInstructions {
    pub next_pulse: DateTime<Utc>,
    /// Present only while running.
    pub event_query: Option<ShardEventQuery>,
}

pub struct EventProcessorPolicy {
    sharding: Sharding,
    range_function: Arc<dyn RangeFunction>,
    last_query: Option<ShardEventQuery>,
    /// Conflict already handed to the failure handler; reported again only
    /// once it changes.
    reported_conflict: Option<Vec<AgentId>>,
}

impl EventProcessorPolicy {
    pub fn new(sharding: Sharding, range_function: Arc<dyn RangeFunction>) -> Self {
        Self {
            sharding,
            range_function,
            last_query: None,
            reported_conflict: None,
        }
    }

    pub fn sharding(&self) -> Sharding {
        self.sharding
    }

    fn suspend(&self, input: &PulseInput<'_>) -> Decision<EventProcessingInstructions> {
        Decision {
            action: WriteAction::Suspend,
            instructions: self.instruct_retry(input.after_pulse_interval()),
        }
    }

    fn wait(
        &self,
        input: &PulseInput<'_>,
        assignment: ShardAssignment,
    ) -> Decision<EventProcessingInstructions> {
        Decision {
            action: WriteAction::Wait(Some(assignment)),
            instructions: self.instruct_retry(input.after_polling_interval()),
        }
    }

    fn query_for(&mut self, assignment: ShardAssignment) -> ShardEventQuery {
        match &self.last_query {
            Some(query) if query.assignment() == assignment => query.clone(),
            _ => {
                let query = ShardEventQuery::new(assignment, self.range_function.as_ref());
                self.last_query = Some(query.clone());
                query
            }
        }
    }
}

impl PulsePolicy for EventProcessorPolicy {
    type Instructions = EventProcessingInstructions;

    fn kind(&self) -> AgentKind {
        match self.sharding {
            Sharding::Dynamic => AgentKind::EventProcessingDynamicSharding,
            Sharding::Static(_) => AgentKind::EventProcessingStaticSharding,
        }
    }

    fn static_assignment(&self) -> Option<ShardAssignment> {
        match self.sharding {
            Sharding::Dynamic => None,
            Sharding::Static(assignment) => Some(assignment),
        }
    }

    fn decide(&mut self, input: &PulseInput<'_>) -> Decision<EventProcessingInstructions> {
        let me = input.current_self;

        if input.peers().any(|agent| agent.kind == AgentKind::MassIndexing) {
            debug!(agent_id = %me.id, "mass indexer present, suspending");
            return self.suspend(input);
        }

        let target = match ClusterTarget::compute(input.roster) {
            Ok(target) => target,
            Err(e) => {
                let agents = e.conflicting_agents();
                if self.reported_conflict.as_ref() != Some(&agents) {
                    self.reported_conflict = Some(agents);
                    input
                        .failure_handler
                        .handle(FailureReport::new("Computing the cluster target", e));
                } else {
                    debug!(agent_id = %me.id, "cluster target conflict persists");
                }
                return self.suspend(input);
            }
        };
        self.reported_conflict = None;

        let Some(assignment) = target.assignment_of(me.id) else {
            debug!(agent_id = %me.id, "excluded from the cluster target, suspending");
            return self.suspend(input);
        };

        if target.descriptor().has_missing_member() {
            debug!(agent_id = %me.id, members = ?target.descriptor().members(), "target has missing members");
            return self.wait(input, assignment);
        }

        if me.shard_assignment != Some(assignment) {
            debug!(
                agent_id = %me.id,
                persisted = ?me.shard_assignment,
                target = %assignment,
                "taking new shard assignment"
            );
            return self.wait(input, assignment);
        }

        let excluded_still_active = target.excluded().iter().any(|id| {
            input
                .find(*id)
                .is_some_and(|agent| agent.state != AgentState::Suspended)
        });
        if excluded_still_active {
            debug!(agent_id = %me.id, "waiting for excluded agents to suspend");
            return self.wait(input, assignment);
        }

        let members_ready = target.descriptor().assignments().all(|(id, slot)| {
            input.find(id).is_some_and(|agent| {
                matches!(agent.state, AgentState::Waiting | AgentState::Running)
                    && agent.shard_assignment == Some(slot)
            })
        });
        if !members_ready {
            debug!(agent_id = %me.id, "waiting for members to reach the target");
            return self.wait(input, assignment);
        }

        let query = self.query_for(assignment);
        Decision {
            action: WriteAction::Run(Some(assignment)),
            instructions: EventProcessingInstructions {
                next_pulse: input.after_pulse_interval(),
                event_query: Some(query),
            },
        }
    }

    fn instruct_retry(&self, next_pulse: DateTime<Utc>) -> EventProcessingInstructions {
        EventProcessingInstructions {
            next_pulse,
            event_query: None,
        }
    }
}
