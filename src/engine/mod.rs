//! Reservation Lifecycle Engine.
//!
//! Owns the expiry schedule and drives every reservation through
//! reserve → (timer | cancel) → complete, keeping the store, the relay and
//! the in-memory schedule consistent. `start` runs the recovery sweep before
//! any reservation traffic is accepted.

mod error;
mod lifecycle;
mod queries;
mod recovery;
mod schedule;

pub use error::{EngineError, ErrorKind};
pub use lifecycle::CompletionReport;
pub use recovery::RecoveryReport;
pub use schedule::ExpirySchedule;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::actuation::Actuator;
use crate::model::*;
use crate::quota::QuotaPolicy;
use crate::store::Store;

pub struct Engine {
    pub store: Arc<Store>,
    pub(super) actuator: Arc<dyn Actuator>,
    pub quota: QuotaPolicy,
    pub schedule: ExpirySchedule,
    /// Serializes check-and-commit per resource.
    resource_locks: DashMap<ResourceId, Arc<Mutex<()>>>,
    /// Resources whose physical state is unknown, with the reason.
    quarantine: DashMap<ResourceId, String>,
    ready: AtomicBool,
}

impl Engine {
    pub fn new(store: Arc<Store>, actuator: Arc<dyn Actuator>, quota: QuotaPolicy) -> Arc<Self> {
        Arc::new(Self {
            store,
            actuator,
            quota,
            schedule: ExpirySchedule::new(),
            resource_locks: DashMap::new(),
            quarantine: DashMap::new(),
            ready: AtomicBool::new(false),
        })
    }

    /// Run the recovery sweep, then start accepting requests.
    pub async fn start(self: &Arc<Self>) -> Result<RecoveryReport, EngineError> {
        let report = self.recover_on_startup().await?;
        self.ready.store(true, Ordering::SeqCst);
        info!(
            completed = report.completed.len(),
            rearmed = report.rearmed.len(),
            inconsistent = report.inconsistencies.len(),
            "engine started"
        );
        Ok(report)
    }

    /// Stop accepting requests and drop every pending timer. Active rows stay
    /// active; the next `start` picks them up.
    pub async fn close(&self) {
        self.ready.store(false, Ordering::SeqCst);
        let stopped = self.schedule.clear().await;
        info!(stopped, "engine closed");
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub(super) fn ensure_ready(&self) -> Result<(), EngineError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(EngineError::NotReady)
        }
    }

    pub async fn set_quota_limit(&self, limit: i64) -> Result<(), EngineError> {
        self.quota.set_max_active_reservations(limit).await
    }

    /// Delete a printer and its reservation history. Refused while the
    /// printer has an active reservation.
    pub async fn delete_resource(&self, id: ResourceId) -> Result<(), EngineError> {
        self.ensure_ready()?;
        let _lock = self.lock_resource(id).await;
        let mut tx = self.store.begin().await;
        if tx.resource(id).is_none() {
            return Err(EngineError::UnknownResource(id));
        }
        if tx.is_held(id) {
            return Err(EngineError::HasActiveReservation(id));
        }
        tx.delete_resource(id);
        tx.commit().await?;
        self.resource_locks.remove(&id);
        self.quarantine.remove(&id);
        info!(resource_id = id, "resource deleted with its history");
        Ok(())
    }

    pub(super) async fn lock_resource(&self, id: ResourceId) -> OwnedMutexGuard<()> {
        let lock = self
            .resource_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub(super) fn quarantine(&self, id: ResourceId, reason: String) {
        warn!(resource_id = id, %reason, "resource quarantined");
        metrics::counter!(crate::observability::QUARANTINED_TOTAL).increment(1);
        self.quarantine.insert(id, reason);
    }

    pub fn is_quarantined(&self, id: ResourceId) -> bool {
        self.quarantine.contains_key(&id)
    }

    /// Quarantined resources and why, ordered by id.
    pub fn quarantined(&self) -> Vec<(ResourceId, String)> {
        let mut out: Vec<_> = self
            .quarantine
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Manual reconciliation hook: returns true if the resource was quarantined.
    pub fn clear_quarantine(&self, id: ResourceId) -> bool {
        let cleared = self.quarantine.remove(&id).is_some();
        if cleared {
            info!(resource_id = id, "quarantine cleared");
        }
        cleared
    }

    /// Register a timer that completes the reservation after `delay`.
    pub(super) async fn arm_expiry(self: &Arc<Self>, reservation: &Reservation, delay: Duration) {
        let info = ScheduledExpiry {
            reservation_id: reservation.id,
            resource_id: reservation.resource_id,
            user_id: reservation.user_id,
            complete_at: reservation.complete_at,
        };
        let engine = Arc::downgrade(self);
        let mut guard = self.schedule.arm().await;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(engine) = engine.upgrade() else { return };
            // Claim the entry before touching the store. Once claimed, a
            // concurrent cancel finds nothing to abort; if cancel got there
            // first, it owns the completion.
            if engine.schedule.remove(info.reservation_id).await.is_none() {
                return;
            }
            engine.expire(info.resource_id, info.reservation_id).await;
        });
        guard.insert(info, timer.abort_handle());
    }
}
