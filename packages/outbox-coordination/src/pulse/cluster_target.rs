//! Target shard layout, derived from the agent roster.
//!
//! Pure and deterministic: every agent computes the same target from the
//! same roster, which is what lets the fleet agree on a layout without ever
//! talking directly.

use crate::agent::{Agent, AgentId, AgentKind, ShardAssignment, MAX_SHARD_TOTAL};
use crate::error::ClusterTargetError;

/// Members by shard index. `None` marks a shard nobody can take yet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClusterDescriptor {
    members: Vec<Option<AgentId>>,
}

impl ClusterDescriptor {
    pub fn total(&self) -> u32 {
        self.members.len() as u32
    }

    pub fn members(&self) -> &[Option<AgentId>] {
        &self.members
    }

    pub fn has_missing_member(&self) -> bool {
        self.members.iter().any(Option::is_none)
    }

    /// Assigned members with the shard each one should own.
    pub fn assignments(&self) -> impl Iterator<Item = (AgentId, ShardAssignment)> + '_ {
        let total = self.total();
        self.members.iter().enumerate().filter_map(move |(index, member)| {
            let id = (*member)?;
            let assignment = ShardAssignment::new(total, index as u32).ok()?;
            Some((id, assignment))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClusterTarget {
    descriptor: ClusterDescriptor,
    excluded: Vec<AgentId>,
}

impl ClusterTarget {
    /// Computes the target layout.
    ///
    /// Only event-processing agents take part. Statically sharded agents
    /// keep their declared slot; the lowest-id one fixes the total. Dynamic
    /// agents fill the remaining slots in id order, or form the whole layout
    /// when no static agent exists. Dynamic agents left over are excluded.
    pub fn compute(roster: &[Agent]) -> Result<Self, ClusterTargetError> {
        let mut agents: Vec<&Agent> = roster
            .iter()
            .filter(|agent| agent.kind.is_event_processing())
            .collect();
        agents.sort_by_key(|agent| agent.id);

        let mut fixed_total: Option<(AgentId, u32)> = None;
        let mut statics = Vec::new();
        let mut dynamics = Vec::new();

        for agent in agents {
            if agent.kind == AgentKind::EventProcessingDynamicSharding {
                dynamics.push(agent.id);
                continue;
            }

            let Some(assignment) = agent.shard_assignment else {
                return Err(ClusterTargetError::MissingStaticAssignment {
                    agent: agent.id,
                    roster: roster.to_vec(),
                });
            };

            if assignment.total() > MAX_SHARD_TOTAL {
                return Err(ClusterTargetError::ShardTotalTooLarge {
                    agent: agent.id,
                    declared: assignment.total(),
                    max: MAX_SHARD_TOTAL,
                    roster: roster.to_vec(),
                });
            }

            match fixed_total {
                None => fixed_total = Some((agent.id, assignment.total())),
                Some((first, expected)) if expected != assignment.total() => {
                    return Err(ClusterTargetError::TotalShardCountConflict {
                        agent: agent.id,
                        declared: assignment.total(),
                        first,
                        expected,
                        roster: roster.to_vec(),
                    });
                }
                Some(_) => {}
            }
            statics.push((agent.id, assignment));
        }

        let total = match fixed_total {
            Some((_, total)) => total as usize,
            None => dynamics.len().min(MAX_SHARD_TOTAL as usize),
        };
        let mut members: Vec<Option<AgentId>> = vec![None; total];

        for (id, assignment) in statics {
            let slot = &mut members[assignment.index() as usize];
            if let Some(first) = *slot {
                return Err(ClusterTargetError::ShardIndexConflict {
                    first,
                    second: id,
                    index: assignment.index(),
                    total: assignment.total(),
                    roster: roster.to_vec(),
                });
            }
            *slot = Some(id);
        }

        let mut excluded = Vec::new();
        for id in dynamics {
            match members.iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => *slot = Some(id),
                None => excluded.push(id),
            }
        }

        Ok(Self {
            descriptor: ClusterDescriptor { members },
            excluded,
        })
    }

    pub fn descriptor(&self) -> &ClusterDescriptor {
        &self.descriptor
    }

    pub fn excluded(&self) -> &[AgentId] {
        &self.excluded
    }

    pub fn is_excluded(&self, id: AgentId) -> bool {
        self.excluded.contains(&id)
    }

    /// The shard `id` should own, if it is a member.
    pub fn assignment_of(&self, id: AgentId) -> Option<ShardAssignment> {
        let index = self
            .descriptor
            .members
            .iter()
            .position(|member| *member == Some(id))?;
        ShardAssignment::new(self.descriptor.total(), index as u32).ok()
    }
}
