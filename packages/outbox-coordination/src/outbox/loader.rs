use tracing::debug;

use super::{LockMode, OutboxEvent, OutboxEventId, OutboxStore, OutboxTransaction};
use crate::error::StoreError;

/// Locks outbox rows before they are processed or updated.
///
/// Prefers skip-locked when the store supports it. Contention never escapes
/// as an error: the batch simply comes back empty and the caller tries again
/// next cycle.
#[derive(Debug, Clone, Copy)]
pub struct OutboxEventLoader {
    mode: LockMode,
}

impl OutboxEventLoader {
    pub fn new(mode: LockMode) -> Self {
        Self { mode }
    }

    pub fn for_store(store: &dyn OutboxStore) -> Self {
        if store.supports_skip_locked() {
            Self::new(LockMode::SkipLocked)
        } else {
            Self::new(LockMode::Exclusive)
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Locks and loads the given events within `tx`.
    pub async fn load_locking(
        &self,
        tx: &mut dyn OutboxTransaction,
        ids: &[OutboxEventId],
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        match tx.lock(ids, self.mode).await {
            Ok(events) => Ok(events),
            Err(StoreError::LockContention) => {
                debug!(requested = ids.len(), mode = ?self.mode, "outbox rows locked elsewhere");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}
