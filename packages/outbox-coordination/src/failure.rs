//! Non-fatal failure reporting.
//!
//! Conditions that must be seen by an operator but must not stop an agent
//! (conflicting shard configuration, events that exhausted their retries) are
//! handed to a [`FailureHandler`]. Handlers never propagate anything back.

use std::fmt;

use tracing::error;

use crate::outbox::EntityReference;

/// One reported failure.
#[derive(Debug)]
pub struct FailureReport {
    /// What the agent was doing, in plain words.
    pub operation: String,
    pub error: anyhow::Error,
    /// Entities affected, when the failure concerns specific outbox events.
    pub entities: Vec<EntityReference>,
}

impl FailureReport {
    pub fn new(operation: impl Into<String>, error: impl Into<anyhow::Error>) -> Self {
        Self {
            operation: operation.into(),
            error: error.into(),
            entities: Vec::new(),
        }
    }

    pub fn with_entity(mut self, entity: EntityReference) -> Self {
        self.entities.push(entity);
        self
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.error)?;
        if !self.entities.is_empty() {
            let entities: Vec<String> = self.entities.iter().map(ToString::to_string).collect();
            write!(f, " (entities: {})", entities.join(", "))?;
        }
        Ok(())
    }
}

pub trait FailureHandler: Send + Sync {
    fn handle(&self, report: FailureReport);
}

/// Logs every report at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingFailureHandler;

impl FailureHandler for TracingFailureHandler {
    fn handle(&self, report: FailureReport) {
        let entities: Vec<String> = report.entities.iter().map(ToString::to_string).collect();
        error!(
            operation = %report.operation,
            error = ?report.error,
            entities = ?entities,
            "coordination failure"
        );
    }
}
