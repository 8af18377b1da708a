use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tracing::{debug, info, warn};

use super::{OutboxEventId, OutboxEventLoader, OutboxEventStatus, OutboxStore, MAX_RETRIES};
use crate::clock::Clock;
use crate::config::to_delta;
use crate::error::StoreError;
use crate::failure::{FailureHandler, FailureReport};

/// Relock attempts per [`OutboxEventUpdater::apply`] call.
const MAX_LOCK_ATTEMPTS: usize = 3;

/// Result of processing one batch, as reported by the processor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingOutcome {
    pub succeeded: Vec<OutboxEventId>,
    /// Failed events with the error message of the attempt.
    pub failed: Vec<(OutboxEventId, String)>,
}

impl ProcessingOutcome {
    pub fn succeed(&mut self, id: OutboxEventId) {
        self.succeeded.push(id);
    }

    pub fn fail(&mut self, id: OutboxEventId, error: impl Into<String>) {
        self.failed.push((id, error.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub deleted: u64,
    pub rescheduled: Vec<OutboxEventId>,
    pub aborted: Vec<OutboxEventId>,
    /// Events that could not be locked this round. They stay untouched and
    /// are picked up again on a later cycle.
    pub still_to_process: Vec<OutboxEventId>,
}

impl UpdateReport {
    /// Whether any event left the due set: deleted, pushed into the future
    /// or aborted.
    pub fn made_progress(&self) -> bool {
        self.deleted > 0 || !self.rescheduled.is_empty() || !self.aborted.is_empty()
    }
}

/// Applies a [`ProcessingOutcome`] to the outbox table.
///
/// Succeeded events are deleted. Failed events get their retry count bumped:
/// on reaching [`MAX_RETRIES`] they are aborted and reported, otherwise they
/// are rescheduled `retry_delay` into the future.
pub struct OutboxEventUpdater {
    loader: OutboxEventLoader,
    retry_delay: Duration,
    clock: Arc<dyn Clock>,
    failure_handler: Arc<dyn FailureHandler>,
}

impl OutboxEventUpdater {
    pub fn new(
        loader: OutboxEventLoader,
        retry_delay: Duration,
        clock: Arc<dyn Clock>,
        failure_handler: Arc<dyn FailureHandler>,
    ) -> Self {
        Self {
            loader,
            retry_delay,
            clock,
            failure_handler,
        }
    }

    pub async fn apply(
        &self,
        store: &dyn OutboxStore,
        outcome: ProcessingOutcome,
    ) -> Result<UpdateReport, StoreError> {
        let failures: HashMap<OutboxEventId, String> = outcome.failed.into_iter().collect();
        let mut remaining: BTreeSet<OutboxEventId> = outcome
            .succeeded
            .into_iter()
            .chain(failures.keys().copied())
            .collect();
        let mut report = UpdateReport::default();

        for attempt in 1..=MAX_LOCK_ATTEMPTS {
            if remaining.is_empty() {
                break;
            }

            let ids: Vec<OutboxEventId> = remaining.iter().copied().collect();
            let mut tx = store.begin_outbox().await?;
            let events = self.loader.load_locking(tx.as_mut(), &ids).await?;
            if events.is_empty() {
                debug!(attempt, pending = ids.len(), "no outbox rows locked this attempt");
                continue;
            }

            let now = self.clock.now();
            let mut to_delete = Vec::new();
            let mut aborted = Vec::new();

            for mut event in events {
                remaining.remove(&event.id);

                let Some(error) = failures.get(&event.id) else {
                    to_delete.push(event.id);
                    continue;
                };

                event.retries += 1;
                if event.retries >= MAX_RETRIES {
                    event.status = OutboxEventStatus::Aborted;
                    report.aborted.push(event.id);
                    aborted.push((event.entity_reference(), error.clone(), event.retries));
                } else {
                    event.process_after = now + to_delta(self.retry_delay);
                    report.rescheduled.push(event.id);
                }
                tx.update(&event).await?;
            }

            if !to_delete.is_empty() {
                report.deleted += tx.delete(&to_delete).await?;
            }
            tx.commit().await?;

            for (entity, error, retries) in aborted {
                warn!(entity = %entity, retries, "outbox event aborted");
                self.failure_handler.handle(
                    FailureReport::new(
                        "Processing outbox event",
                        anyhow!("{} (gave up after {} attempts)", error, retries),
                    )
                    .with_entity(entity),
                );
            }
        }

        report.still_to_process = remaining.into_iter().collect();
        if !report.still_to_process.is_empty() {
            info!(
                count = report.still_to_process.len(),
                "outbox events left for a later cycle"
            );
        }

        Ok(report)
    }
}
