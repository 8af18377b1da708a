//! Bulk-rebuild policy.
//!
//! Event processors suspend as soon as they see a mass indexer in the roster.
//! The mass indexer in turn only runs once every event processor is
//! suspended, and never on its first pulse.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{Decision, PulseInput, PulsePolicy, WriteAction};
use crate::agent::{AgentKind, AgentState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MassIndexingInstructions {
    pub next_pulse: DateTime<Utc>,
    /// True once every event processor is known to be suspended.
    pub consider_event_processing_suspended: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MassIndexerPolicy;

impl PulsePolicy for MassIndexerPolicy {
    type Instructions = MassIndexingInstructions;

    fn kind(&self) -> AgentKind {
        AgentKind::MassIndexing
    }

    fn decide(&mut self, input: &PulseInput<'_>) -> Decision<MassIndexingInstructions> {
        let active_processors: Vec<_> = input
            .peers()
            .filter(|agent| agent.kind.is_event_processing() && agent.state != AgentState::Suspended)
            .map(|agent| agent.id)
            .collect();

        if !active_processors.is_empty() {
            debug!(active = ?active_processors, "waiting for event processors to suspend");
            return Decision {
                action: WriteAction::Wait(None),
                instructions: self.instruct_retry(input.after_polling_interval()),
            };
        }

        // At least one full pulse in WAITING before running.
        if input.current_self.state == AgentState::Suspended {
            return Decision {
                action: WriteAction::Wait(None),
                instructions: self.instruct_retry(input.after_polling_interval()),
            };
        }

        Decision {
            action: WriteAction::Run(None),
            instructions: MassIndexingInstructions {
                next_pulse: input.after_pulse_interval(),
                consider_event_processing_suspended: true,
            },
        }
    }

    fn instruct_retry(&self, next_pulse: DateTime<Utc>) -> MassIndexingInstructions {
        MassIndexingInstructions {
            next_pulse,
            consider_event_processing_suspended: false,
        }
    }
}
