use std::collections::HashMap;

use tokio::sync::{RwLock, RwLockWriteGuard};
use tokio::task::AbortHandle;

use crate::model::*;

struct Entry {
    info: ScheduledExpiry,
    timer: AbortHandle,
}

/// In-memory expiry schedule: one cancellable timer per active reservation
/// this process has taken ownership of. Never persisted; recovery rebuilds it.
///
/// The lock only ever covers map mutation, never store or actuation I/O.
#[derive(Default)]
pub struct ExpirySchedule {
    entries: RwLock<HashMap<ReservationId, Entry>>,
}

/// Write access held while spawning a timer, so the timer can't fire and try
/// to remove its entry before the entry exists.
pub(super) struct ArmGuard<'a> {
    entries: RwLockWriteGuard<'a, HashMap<ReservationId, Entry>>,
}

impl ArmGuard<'_> {
    pub(super) fn insert(&mut self, info: ScheduledExpiry, timer: AbortHandle) {
        let previous = self
            .entries
            .insert(info.reservation_id, Entry { info, timer });
        if let Some(old) = previous {
            old.timer.abort();
        }
        metrics::gauge!(crate::observability::SCHEDULED_EXPIRIES).set(self.entries.len() as f64);
    }
}

impl ExpirySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) async fn arm(&self) -> ArmGuard<'_> {
        ArmGuard {
            entries: self.entries.write().await,
        }
    }

    /// Remove an entry and stop its timer. When called from the timer's own
    /// task the timer is already spent, so it's left alone rather than having
    /// the running completion abort itself.
    pub async fn remove(&self, id: ReservationId) -> Option<ScheduledExpiry> {
        let mut entries = self.entries.write().await;
        let entry = entries.remove(&id)?;
        if tokio::task::try_id() != Some(entry.timer.id()) {
            entry.timer.abort();
        }
        metrics::gauge!(crate::observability::SCHEDULED_EXPIRIES).set(entries.len() as f64);
        Some(entry.info)
    }

    pub async fn contains(&self, id: ReservationId) -> bool {
        self.entries.read().await.contains_key(&id)
    }

    pub async fn get(&self, id: ReservationId) -> Option<ScheduledExpiry> {
        self.entries.read().await.get(&id).map(|e| e.info)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Snapshot ordered by due time.
    pub async fn snapshot(&self) -> Vec<ScheduledExpiry> {
        let mut out: Vec<ScheduledExpiry> =
            self.entries.read().await.values().map(|e| e.info).collect();
        out.sort_by_key(|e| (e.complete_at, e.reservation_id));
        out
    }

    /// Stop every timer and empty the schedule.
    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.write().await;
        let n = entries.len();
        for (_, entry) in entries.drain() {
            entry.timer.abort();
        }
        metrics::gauge!(crate::observability::SCHEDULED_EXPIRIES).set(0.0);
        n
    }
}
