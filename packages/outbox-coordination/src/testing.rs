//! Test doubles for the coordination stores and injected capabilities.
//!
//! Only available with the `testing` feature (and in this crate's own tests):
//!
//! ```toml
//! [dev-dependencies]
//! outbox-coordination = { path = "...", features = ["testing"] }
//! ```
//!
//! [`InMemoryStore`] behaves like a read-committed database with row locks:
//! writes are staged per transaction and only become visible on commit, and
//! outbox row locks are held until the transaction commits or is dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use uuid::Uuid;

use crate::agent::{Agent, AgentId, AgentStore, AgentTransaction, NewAgent};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::failure::{FailureHandler, FailureReport};
use crate::id::Id;
use crate::outbox::{
    EntityReference, LockMode, NewOutboxEvent, OutboxEvent, OutboxEventId, OutboxEventStatus,
    OutboxStore, OutboxTransaction, RoutingRange,
};

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Default)]
struct Tables {
    agents: BTreeMap<AgentId, Agent>,
    events: BTreeMap<OutboxEventId, OutboxEvent>,
    /// Outbox row locks: event id -> owning transaction.
    locks: HashMap<OutboxEventId, u64>,
    next_id: u128,
    next_tx: u64,
}

impl Tables {
    /// Sequential ids, so id order is creation order.
    fn next_uuid(&mut self) -> Uuid {
        self.next_id += 1;
        Uuid::from_u128(self.next_id)
    }

    fn next_tx(&mut self) -> u64 {
        self.next_tx += 1;
        self.next_tx
    }
}

/// Shared in-memory implementation of [`AgentStore`] and [`OutboxStore`].
///
/// Clones share the same tables, so one store can stand in for a database
/// shared by several agents.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Tables>>,
    skip_locked: bool,
    unavailable: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Tables::default())),
            skip_locked: true,
            unavailable: Arc::new(AtomicBool::new(false)),
            clock: Arc::new(SystemClock),
        }
    }

    /// Uses `clock` for database-side defaults (created-at, process-after).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Behaves like a backend without `SKIP LOCKED`.
    pub fn without_skip_locked(mut self) -> Self {
        self.skip_locked = false;
        self
    }

    /// While set, beginning a transaction fails with a backend error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        lock_tables(&self.inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(anyhow::anyhow!("store unavailable")));
        }
        Ok(())
    }

    /// Committed agents, ordered by id.
    pub fn agents(&self) -> Vec<Agent> {
        self.tables()
            .map(|t| t.agents.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn agent(&self, id: AgentId) -> Option<Agent> {
        self.tables().ok().and_then(|t| t.agents.get(&id).cloned())
    }

    /// Inserts an agent row directly and returns its id.
    pub fn insert_agent(&self, agent: NewAgent) -> Option<AgentId> {
        let mut t = self.tables().ok()?;
        let id = Id::from_uuid(t.next_uuid());
        t.agents.insert(id, agent.into_agent(id));
        Some(id)
    }

    pub fn remove_agent(&self, id: AgentId) {
        if let Ok(mut t) = self.tables() {
            t.agents.remove(&id);
        }
    }

    /// Committed outbox events, ordered by id.
    pub fn events(&self) -> Vec<OutboxEvent> {
        self.tables()
            .map(|t| t.events.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn event(&self, id: OutboxEventId) -> Option<OutboxEvent> {
        self.tables().ok().and_then(|t| t.events.get(&id).cloned())
    }

    /// Whether some open transaction holds a lock on the event.
    pub fn is_locked(&self, id: OutboxEventId) -> bool {
        self.tables().map(|t| t.locks.contains_key(&id)).unwrap_or(false)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_tables(inner: &Mutex<Tables>) -> Result<MutexGuard<'_, Tables>, StoreError> {
    inner
        .lock()
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("mutex poisoned: {}", e)))
}

// -----------------------------------------------------------------------------
// Agent transactions
// -----------------------------------------------------------------------------

enum AgentWrite {
    Insert(Agent),
    Update(Agent),
    Delete,
}

struct InMemoryAgentTransaction {
    inner: Arc<Mutex<Tables>>,
    staged: BTreeMap<AgentId, AgentWrite>,
}

impl InMemoryAgentTransaction {
    fn visible(&self) -> Result<BTreeMap<AgentId, Agent>, StoreError> {
        let mut agents = lock_tables(&self.inner)?.agents.clone();
        for (id, write) in &self.staged {
            match write {
                AgentWrite::Insert(agent) | AgentWrite::Update(agent) => {
                    agents.insert(*id, agent.clone());
                }
                AgentWrite::Delete => {
                    agents.remove(id);
                }
            }
        }
        Ok(agents)
    }
}

#[async_trait]
impl AgentStore for InMemoryStore {
    async fn begin_agents(&self) -> Result<Box<dyn AgentTransaction>, StoreError> {
        self.check_available()?;
        Ok(Box::new(InMemoryAgentTransaction {
            inner: self.inner.clone(),
            staged: BTreeMap::new(),
        }))
    }
}

#[async_trait]
impl AgentTransaction for InMemoryAgentTransaction {
    async fn find_all_ordered_by_id(&mut self) -> Result<Vec<Agent>, StoreError> {
        Ok(self.visible()?.into_values().collect())
    }

    async fn find(&mut self, id: AgentId) -> Result<Option<Agent>, StoreError> {
        Ok(self.visible()?.remove(&id))
    }

    async fn create(&mut self, agent: NewAgent) -> Result<AgentId, StoreError> {
        let id = Id::from_uuid(lock_tables(&self.inner)?.next_uuid());
        self.staged.insert(id, AgentWrite::Insert(agent.into_agent(id)));
        Ok(id)
    }

    async fn update(&mut self, agent: &Agent) -> Result<(), StoreError> {
        let write = match self.staged.get(&agent.id) {
            Some(AgentWrite::Insert(_)) => AgentWrite::Insert(agent.clone()),
            Some(AgentWrite::Delete) => return Ok(()),
            _ => AgentWrite::Update(agent.clone()),
        };
        self.staged.insert(agent.id, write);
        Ok(())
    }

    async fn delete(&mut self, ids: &[AgentId]) -> Result<u64, StoreError> {
        let visible = self.visible()?;
        let mut removed = 0;
        for id in ids {
            if visible.contains_key(id) {
                self.staged.insert(*id, AgentWrite::Delete);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut tables = lock_tables(&self.inner)?;
        for (id, write) in &self.staged {
            match write {
                AgentWrite::Insert(agent) => {
                    tables.agents.insert(*id, agent.clone());
                }
                // Rows deleted concurrently stay deleted, like an UPDATE
                // matching zero rows.
                AgentWrite::Update(agent) => {
                    if let Some(row) = tables.agents.get_mut(id) {
                        *row = agent.clone();
                    }
                }
                AgentWrite::Delete => {
                    tables.agents.remove(id);
                }
            }
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Outbox transactions
// -----------------------------------------------------------------------------

struct InMemoryOutboxTransaction {
    id: u64,
    inner: Arc<Mutex<Tables>>,
    staged: BTreeMap<OutboxEventId, Option<OutboxEvent>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryOutboxTransaction {
    fn visible(&self, tables: &Tables, id: &OutboxEventId) -> Option<OutboxEvent> {
        match self.staged.get(id) {
            Some(write) => write.clone(),
            None => tables.events.get(id).cloned(),
        }
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn begin_outbox(&self) -> Result<Box<dyn OutboxTransaction>, StoreError> {
        self.check_available()?;
        let id = self.tables()?.next_tx();
        Ok(Box::new(InMemoryOutboxTransaction {
            id,
            inner: self.inner.clone(),
            staged: BTreeMap::new(),
            clock: self.clock.clone(),
        }))
    }

    fn supports_skip_locked(&self) -> bool {
        self.skip_locked
    }
}

#[async_trait]
impl OutboxTransaction for InMemoryOutboxTransaction {
    async fn insert(&mut self, event: NewOutboxEvent) -> Result<OutboxEventId, StoreError> {
        let now = self.clock.now();
        let id = Id::from_uuid(lock_tables(&self.inner)?.next_uuid());
        let routing_hash = event.routing_hash();
        self.staged.insert(
            id,
            Some(OutboxEvent {
                id,
                entity_name: event.entity_name,
                entity_id: event.entity_id,
                routing_hash,
                payload: event.payload,
                status: OutboxEventStatus::Pending,
                retries: 0,
                process_after: event.process_after.unwrap_or(now),
                created_at: now,
            }),
        );
        Ok(id)
    }

    async fn find_due(
        &mut self,
        range: RoutingRange,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OutboxEventId>, StoreError> {
        let tables = lock_tables(&self.inner)?;
        let ids: Vec<OutboxEventId> = tables
            .events
            .keys()
            .chain(self.staged.keys())
            .copied()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut due: Vec<OutboxEvent> = ids
            .iter()
            .filter_map(|id| self.visible(&tables, id))
            .filter(|event| event.is_due(now) && range.contains(event.routing_hash))
            .collect();
        due.sort_by_key(|event| (event.process_after, event.id));

        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|event| event.id)
            .collect())
    }

    async fn lock(
        &mut self,
        ids: &[OutboxEventId],
        mode: LockMode,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let mut tables = lock_tables(&self.inner)?;
        let mut sorted = ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut candidates = Vec::new();
        for id in sorted {
            let Some(event) = self.visible(&tables, &id) else {
                continue;
            };
            if event.status != OutboxEventStatus::Pending {
                continue;
            }
            match tables.locks.get(&id) {
                Some(owner) if *owner != self.id => match mode {
                    LockMode::SkipLocked => continue,
                    LockMode::Exclusive => return Err(StoreError::LockContention),
                },
                _ => candidates.push(event),
            }
        }

        for event in &candidates {
            tables.locks.insert(event.id, self.id);
        }
        Ok(candidates)
    }

    async fn update(&mut self, event: &OutboxEvent) -> Result<(), StoreError> {
        self.staged.insert(event.id, Some(event.clone()));
        Ok(())
    }

    async fn delete(&mut self, ids: &[OutboxEventId]) -> Result<u64, StoreError> {
        let tables = lock_tables(&self.inner)?;
        let mut removed = 0;
        for id in ids {
            if self.visible(&tables, id).is_some() {
                self.staged.insert(*id, None);
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Applies staged writes. Locks are released when the transaction drops.
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut tables = lock_tables(&self.inner)?;
        for (id, write) in &self.staged {
            match write {
                Some(event) => tables.events.insert(*id, event.clone()),
                None => tables.events.remove(id),
            };
        }
        Ok(())
    }
}

impl Drop for InMemoryOutboxTransaction {
    fn drop(&mut self) {
        if let Ok(mut tables) = self.inner.lock() {
            let id = self.id;
            tables.locks.retain(|_, owner| *owner != id);
        }
    }
}

// =============================================================================
// Clock and failure handler
// =============================================================================

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Starts at 2024-01-01T00:00:00Z.
    pub fn at_epoch() -> Self {
        Self::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default())
    }

    pub fn advance(&self, delta: TimeDelta) {
        if let Ok(mut now) = self.now.lock() {
            *now += delta;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_default()
    }
}

/// Keeps every report for later assertions.
#[derive(Default)]
pub struct RecordingFailureHandler {
    reports: Mutex<Vec<(String, Vec<EntityReference>)>>,
}

impl RecordingFailureHandler {
    /// Displayed reports, oldest first.
    pub fn reports(&self) -> Vec<String> {
        self.reports
            .lock()
            .map(|r| r.iter().map(|(text, _)| text.clone()).collect())
            .unwrap_or_default()
    }

    /// Entities of every report, oldest first.
    pub fn entities(&self) -> Vec<EntityReference> {
        self.reports
            .lock()
            .map(|r| r.iter().flat_map(|(_, e)| e.iter().cloned()).collect())
            .unwrap_or_default()
    }
}

impl FailureHandler for RecordingFailureHandler {
    fn handle(&self, report: FailureReport) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push((report.to_string(), report.entities));
        }
    }
}
