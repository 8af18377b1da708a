//! PostgreSQL store integration tests.
//!
//! These start a Postgres container and are ignored by default. Run them
//! with `cargo test -p outbox-coordination -- --ignored`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use common::TestHarness;
use outbox_coordination::{
    AgentKind, AgentState, AgentStore, EventProcessorPolicy, FailureHandler, LockMode, NewAgent,
    NewOutboxEvent, OutboxEventId, OutboxEventLoader, OutboxEventStatus, OutboxEventUpdater,
    OutboxStore, PgStore, ProcessingOutcome, PulseConfig, PulseContext, PulseEngine,
    RangeFunction, RoutingRange, ShardAssignment, Sharding, SystemClock, TracingFailureHandler,
    UniformHashRanges, MAX_RETRIES,
};
use test_context::test_context;

async fn seed(store: &PgStore, entity_ids: &[&str]) -> Vec<OutboxEventId> {
    let mut tx = store.begin_outbox().await.unwrap();
    let mut ids = Vec::new();
    for entity_id in entity_ids {
        let event = NewOutboxEvent::builder()
            .entity_name("Book")
            .entity_id(*entity_id)
            .payload(serde_json::json!({ "op": "reindex" }))
            .build();
        ids.push(tx.insert(event).await.unwrap());
    }
    tx.commit().await.unwrap();
    ids
}

fn context(store: &PgStore) -> PulseContext {
    let failure_handler: Arc<dyn FailureHandler> = Arc::new(TracingFailureHandler);
    PulseContext {
        agents: Arc::new(store.clone()),
        clock: Arc::new(SystemClock),
        failure_handler,
    }
}

// ============================================================================
// Outbox table
// ============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn insert_and_find_due_by_range(ctx: &TestHarness) {
    let ids = seed(&ctx.store, &["1", "2", "3", "4"]).await;

    let mut tx = ctx.store.begin_outbox().await.unwrap();
    let all = tx.find_due(RoutingRange::ALL, Utc::now(), 10).await.unwrap();
    assert_eq!(all.len(), ids.len());

    // The two halves of the hash space partition the due events.
    let lower = UniformHashRanges.range_for(ShardAssignment::new(2, 0).unwrap());
    let upper = UniformHashRanges.range_for(ShardAssignment::new(2, 1).unwrap());
    let mut split = tx.find_due(lower, Utc::now(), 10).await.unwrap();
    split.extend(tx.find_due(upper, Utc::now(), 10).await.unwrap());
    split.sort();
    let mut expected = ids.clone();
    expected.sort();
    assert_eq!(split, expected);

    let limited = tx.find_due(RoutingRange::ALL, Utc::now(), 2).await.unwrap();
    assert_eq!(limited.len(), 2);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn future_events_are_not_due(ctx: &TestHarness) {
    let mut tx = ctx.store.begin_outbox().await.unwrap();
    let later = tx
        .insert(
            NewOutboxEvent::builder()
                .entity_name("Book")
                .entity_id("7")
                .process_after(Utc::now() + TimeDelta::minutes(5))
                .build(),
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = ctx.store.begin_outbox().await.unwrap();
    assert!(tx
        .find_due(RoutingRange::ALL, Utc::now(), 10)
        .await
        .unwrap()
        .is_empty());
    let due = tx
        .find_due(RoutingRange::ALL, Utc::now() + TimeDelta::minutes(6), 10)
        .await
        .unwrap();
    assert_eq!(due, vec![later]);
}

// ============================================================================
// Locking
// ============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn skip_locked_skips_rows_held_by_another_transaction(ctx: &TestHarness) {
    let ids = seed(&ctx.store, &["1", "2"]).await;

    let mut holder = ctx.store.begin_outbox().await.unwrap();
    let held = holder.lock(&ids[..1], LockMode::SkipLocked).await.unwrap();
    assert_eq!(held.len(), 1);

    let mut other = ctx.store.begin_outbox().await.unwrap();
    let loaded = other.lock(&ids, LockMode::SkipLocked).await.unwrap();
    assert_eq!(loaded.iter().map(|e| e.id).collect::<Vec<_>>(), vec![ids[1]]);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn nowait_contention_yields_an_empty_batch(ctx: &TestHarness) {
    let store = ctx.store.clone().without_skip_locked();
    let ids = seed(&store, &["1", "2"]).await;
    let loader = OutboxEventLoader::for_store(&store);
    assert_eq!(loader.mode(), LockMode::Exclusive);

    let mut holder = store.begin_outbox().await.unwrap();
    loader.load_locking(holder.as_mut(), &ids[..1]).await.unwrap();

    let mut other = store.begin_outbox().await.unwrap();
    assert!(loader
        .load_locking(other.as_mut(), &ids)
        .await
        .unwrap()
        .is_empty());

    holder.commit().await.unwrap();
    drop(other);
    let mut retry = store.begin_outbox().await.unwrap();
    assert_eq!(loader.load_locking(retry.as_mut(), &ids).await.unwrap().len(), 2);
}

// ============================================================================
// Updater
// ============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn updater_deletes_reschedules_and_aborts(ctx: &TestHarness) {
    let ids = seed(&ctx.store, &["ok", "flaky"]).await;
    let (ok, flaky) = (ids[0], ids[1]);
    let updater = OutboxEventUpdater::new(
        OutboxEventLoader::for_store(&ctx.store),
        Duration::ZERO,
        Arc::new(SystemClock),
        Arc::new(TracingFailureHandler),
    );

    let mut outcome = ProcessingOutcome::default();
    outcome.succeed(ok);
    outcome.fail(flaky, "index unavailable");
    let report = updater.apply(&ctx.store, outcome).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.rescheduled, vec![flaky]);

    for _ in 1..MAX_RETRIES {
        let mut outcome = ProcessingOutcome::default();
        outcome.fail(flaky, "index unavailable");
        updater.apply(&ctx.store, outcome).await.unwrap();
    }

    let (status, retries): (OutboxEventStatus, i32) =
        sqlx::query_as("SELECT status, retries FROM outbox_events WHERE id = $1")
            .bind(flaky)
            .fetch_one(&ctx.db_pool)
            .await
            .unwrap();
    assert_eq!(status, OutboxEventStatus::Aborted);
    assert_eq!(retries, MAX_RETRIES);

    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox_events")
        .fetch_one(&ctx.db_pool)
        .await
        .unwrap();
    assert_eq!(remaining, 1);
}

// ============================================================================
// Agent table
// ============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn agent_rows_round_trip_in_id_order(ctx: &TestHarness) {
    let expiration = Utc::now() + TimeDelta::seconds(30);
    let mut tx = ctx.store.begin_agents().await.unwrap();
    let first = tx
        .create(NewAgent {
            kind: AgentKind::EventProcessingStaticSharding,
            name: "static-0".into(),
            state: AgentState::Suspended,
            expiration,
            shard_assignment: Some(ShardAssignment::new(2, 0).unwrap()),
        })
        .await
        .unwrap();
    let second = tx
        .create(NewAgent {
            kind: AgentKind::MassIndexing,
            name: "indexer".into(),
            state: AgentState::Suspended,
            expiration,
            shard_assignment: None,
        })
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = ctx.store.begin_agents().await.unwrap();
    let mut agent = tx.find(second).await.unwrap().unwrap();
    agent.state = AgentState::Running;
    tx.update(&agent).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = ctx.store.begin_agents().await.unwrap();
    let roster = tx.find_all_ordered_by_id().await.unwrap();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(roster.iter().map(|a| a.id).collect::<Vec<_>>(), expected);

    let stored = roster.iter().find(|a| a.id == first).unwrap();
    assert_eq!(stored.shard_assignment, Some(ShardAssignment::new(2, 0).unwrap()));
    assert_eq!(stored.kind, AgentKind::EventProcessingStaticSharding);
    let indexer = roster.iter().find(|a| a.id == second).unwrap();
    assert_eq!(indexer.state, AgentState::Running);

    assert_eq!(tx.delete(&[first, second]).await.unwrap(), 2);
    tx.commit().await.unwrap();
}

// ============================================================================
// Pulse
// ============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn two_dynamic_processors_split_the_hash_space(ctx: &TestHarness) {
    let processor = |name: &str| {
        PulseEngine::new(
            name,
            EventProcessorPolicy::new(Sharding::Dynamic, Arc::new(UniformHashRanges)),
            context(&ctx.store),
            PulseConfig::default(),
        )
    };
    let mut a = processor("a");
    let mut b = processor("b");

    let mut ranges = Vec::new();
    for _ in 0..5 {
        let first = a.pulse().await.unwrap();
        let second = b.pulse().await.unwrap();
        ranges = [first, second]
            .into_iter()
            .filter_map(|instructions| instructions.event_query)
            .map(|query| query.range())
            .collect();
        if ranges.len() == 2 {
            break;
        }
    }

    assert_eq!(ranges.len(), 2, "both processors should be running");
    assert!(ranges[0].end < ranges[1].start || ranges[1].end < ranges[0].start);

    a.leave().await.unwrap();
    b.leave().await.unwrap();

    let mut tx = ctx.store.begin_agents().await.unwrap();
    assert!(tx.find_all_ordered_by_id().await.unwrap().is_empty());
}
