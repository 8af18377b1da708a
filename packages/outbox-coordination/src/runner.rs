//! Background drivers for the pulse engine.
//!
//! The library itself never schedules anything; these runners are the thin
//! scheduler around it:
//!
//! ```text
//! EventProcessorRunner
//!     │
//!     ├─► pulse (PulseEngine<EventProcessorPolicy>)
//!     ├─► until next pulse, if granted a query:
//!     │       ├─► find due events of the shard, lock them (OutboxEventLoader)
//!     │       ├─► process them (EventBatchProcessor)
//!     │       └─► delete / reschedule / abort (OutboxEventUpdater)
//!     └─► on shutdown: leave the agent table
//! ```
//!
//! [`MassIndexerAgent`] runs its own pulse loop in the background and tells
//! the caller once every event processor is suspended.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::AgentId;
use crate::clock::Clock;
use crate::config::{ProcessingConfig, PulseConfig};
use crate::error::{PulseError, StoreError};
use crate::outbox::{
    OutboxEvent, OutboxEventLoader, OutboxEventUpdater, OutboxStore, ProcessingOutcome,
    RangeFunction, ShardEventQuery, UpdateReport,
};
use crate::pulse::{
    EventProcessingInstructions, EventProcessorPolicy, MassIndexerPolicy, PulseContext,
    PulseEngine, Sharding,
};

/// Does the actual indexing work for a batch of locked events.
///
/// Must be idempotent: an event may be processed again after a crash or a
/// shard handover.
#[async_trait]
pub trait EventBatchProcessor: Send + Sync {
    async fn process(&self, events: &[OutboxEvent]) -> ProcessingOutcome;
}

fn until(clock: &dyn Clock, at: DateTime<Utc>) -> Duration {
    (at - clock.now()).to_std().unwrap_or(Duration::ZERO)
}

/// Pause before fetching the next batch. Fetching again right away is only
/// allowed after a batch that moved events out of the due set.
fn pause_after_batch(
    report: Option<&UpdateReport>,
    remaining: Duration,
    polling: Duration,
) -> Duration {
    match report {
        Some(report) if report.made_progress() => Duration::ZERO,
        _ => remaining.min(polling),
    }
}

// ============================================================================
// Event processor
// ============================================================================

pub struct EventProcessorRunner {
    engine: PulseEngine<EventProcessorPolicy>,
    outbox: Arc<dyn OutboxStore>,
    processor: Arc<dyn EventBatchProcessor>,
    loader: OutboxEventLoader,
    updater: OutboxEventUpdater,
    processing: ProcessingConfig,
}

impl EventProcessorRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        sharding: Sharding,
        range_function: Arc<dyn RangeFunction>,
        context: PulseContext,
        outbox: Arc<dyn OutboxStore>,
        processor: Arc<dyn EventBatchProcessor>,
        pulse: PulseConfig,
        processing: ProcessingConfig,
    ) -> Self {
        let loader = OutboxEventLoader::for_store(outbox.as_ref());
        let updater = OutboxEventUpdater::new(
            loader,
            processing.retry_delay,
            context.clock.clone(),
            context.failure_handler.clone(),
        );
        let policy = EventProcessorPolicy::new(sharding, range_function);

        Self {
            engine: PulseEngine::new(name, policy, context, pulse),
            outbox,
            processor,
            loader,
            updater,
            processing,
        }
    }

    pub fn self_id(&self) -> Option<AgentId> {
        self.engine.self_id()
    }

    pub fn name(&self) -> &str {
        self.engine.name()
    }

    /// Runs one pulse.
    pub async fn pulse(&mut self) -> Result<EventProcessingInstructions, PulseError> {
        self.engine.pulse().await
    }

    /// Processes one batch of the shard's due events.
    ///
    /// Returns `None` when nothing was due or every due event was locked
    /// elsewhere.
    pub async fn process_batch(
        &self,
        query: &ShardEventQuery,
    ) -> Result<Option<UpdateReport>, StoreError> {
        let now = self.engine.context().clock.now();

        let mut tx = self.outbox.begin_outbox().await?;
        let ids = query
            .find_due(tx.as_mut(), now, self.processing.batch_size)
            .await?;
        let events = self.loader.load_locking(tx.as_mut(), &ids).await?;
        tx.commit().await?;

        if events.is_empty() {
            return Ok(None);
        }

        debug!(
            agent_name = %self.engine.name(),
            shard = %query.assignment(),
            count = events.len(),
            "processing outbox events"
        );
        let outcome = self.processor.process(&events).await;
        let report = self.updater.apply(self.outbox.as_ref(), outcome).await?;
        Ok(Some(report))
    }

    /// Pulses and processes until `shutdown` fires, then leaves the agent
    /// table.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let clock = self.engine.context().clock.clone();
        let config = *self.engine.config();

        info!(
            agent_name = %self.engine.name(),
            sharding = ?self.engine.policy().sharding(),
            batch_size = self.processing.batch_size,
            "event processor starting"
        );

        'pulses: loop {
            if shutdown.is_cancelled() {
                break;
            }

            let instructions = match self.engine.pulse().await {
                Ok(instructions) => instructions,
                Err(e) => {
                    warn!(agent_name = %self.engine.name(), error = %e, "pulse failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(config.pulse_interval()) => {}
                    }
                    continue;
                }
            };

            loop {
                let remaining = until(clock.as_ref(), instructions.next_pulse);
                if remaining.is_zero() {
                    break;
                }

                let pause = match &instructions.event_query {
                    Some(query) => match self.process_batch(query).await {
                        Ok(report) => {
                            pause_after_batch(report.as_ref(), remaining, config.polling_interval())
                        }
                        Err(e) => {
                            error!(agent_name = %self.engine.name(), error = %e, "processing outbox events failed");
                            remaining
                        }
                    },
                    None => remaining,
                };

                if shutdown.is_cancelled() {
                    break 'pulses;
                }
                if !pause.is_zero() {
                    tokio::select! {
                        _ = shutdown.cancelled() => break 'pulses,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }

        info!(agent_name = %self.engine.name(), "event processor stopping");
        self.engine.leave().await?;
        Ok(())
    }
}

// ============================================================================
// Mass indexer
// ============================================================================

/// A running mass indexer agent.
///
/// Dropping it without [`stop`](Self::stop) still cancels the background
/// loop, which then removes the agent row.
pub struct MassIndexerAgent {
    shutdown: CancellationToken,
    exclusive: watch::Receiver<bool>,
    handle: Option<JoinHandle<()>>,
}

impl MassIndexerAgent {
    /// Registers a mass indexer and waits until every event processor is
    /// suspended.
    pub async fn start(
        name: impl Into<String>,
        context: PulseContext,
        config: PulseConfig,
    ) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let (tx, rx) = watch::channel(false);
        let engine = PulseEngine::new(name, MassIndexerPolicy, context, config);
        let handle = tokio::spawn(Self::pulse_loop(engine, tx, shutdown.clone()));

        let mut agent = Self {
            shutdown,
            exclusive: rx,
            handle: Some(handle),
        };

        if agent.exclusive.wait_for(|exclusive| *exclusive).await.is_err() {
            agent.shutdown.cancel();
            return Err(anyhow!("mass indexer pulse loop ended before gaining exclusivity"));
        }
        Ok(agent)
    }

    /// Whether the latest pulse confirmed that event processing is suspended.
    pub fn is_exclusive(&self) -> bool {
        *self.exclusive.borrow()
    }

    /// Stops pulsing and removes the agent row.
    pub async fn stop(mut self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await?;
        }
        Ok(())
    }

    async fn pulse_loop(
        mut engine: PulseEngine<MassIndexerPolicy>,
        exclusive: watch::Sender<bool>,
        shutdown: CancellationToken,
    ) {
        let clock = engine.context().clock.clone();
        let config = *engine.config();

        loop {
            let pause = match engine.pulse().await {
                Ok(instructions) => {
                    exclusive.send_replace(instructions.consider_event_processing_suspended);
                    until(clock.as_ref(), instructions.next_pulse)
                }
                Err(e) => {
                    warn!(agent_name = %engine.name(), error = %e, "mass indexer pulse failed");
                    exclusive.send_replace(false);
                    config.pulse_interval()
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        exclusive.send_replace(false);
        if let Err(e) = engine.leave().await {
            error!(agent_name = %engine.name(), error = %e, "mass indexer failed to leave");
        }
    }
}

impl Drop for MassIndexerAgent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REMAINING: Duration = Duration::from_millis(500);
    const POLLING: Duration = Duration::from_millis(100);

    fn report(edit: impl FnOnce(&mut UpdateReport)) -> UpdateReport {
        let mut report = UpdateReport::default();
        edit(&mut report);
        report
    }

    #[test]
    fn progress_allows_the_next_batch_immediately() {
        let deleted = report(|r| r.deleted = 3);
        let rescheduled = report(|r| r.rescheduled.push(Default::default()));
        let aborted = report(|r| r.aborted.push(Default::default()));

        for report in [deleted, rescheduled, aborted] {
            assert_eq!(pause_after_batch(Some(&report), REMAINING, POLLING), Duration::ZERO);
        }
    }

    #[test]
    fn batch_without_progress_waits_a_polling_interval() {
        let untouched = report(|r| r.still_to_process.push(Default::default()));

        assert_eq!(pause_after_batch(Some(&untouched), REMAINING, POLLING), POLLING);
        let empty = UpdateReport::default();
        assert_eq!(pause_after_batch(Some(&empty), REMAINING, POLLING), POLLING);
        assert_eq!(pause_after_batch(None, REMAINING, POLLING), POLLING);
    }

    #[test]
    fn pause_never_outlasts_the_next_pulse() {
        let short = Duration::from_millis(20);
        assert_eq!(pause_after_batch(None, short, POLLING), short);
    }
}
