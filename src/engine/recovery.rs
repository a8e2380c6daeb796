use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::model::*;

use super::{Engine, EngineError};

/// Outcome of the startup sweep. Failed rows don't stop the sweep; each one
/// lands in `inconsistencies` and its resource is quarantined.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Overdue reservations completed during the sweep.
    pub completed: Vec<ReservationId>,
    /// Still-running reservations with a fresh timer and the relay back on.
    pub rearmed: Vec<ReservationId>,
    /// Printers marked busy with no active reservation, now freed.
    pub released: Vec<ResourceId>,
    pub inconsistencies: Vec<EngineError>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.inconsistencies.is_empty()
    }
}

fn inconsistency(
    resource: ResourceId,
    reservation: Option<ReservationId>,
    reason: impl Into<String>,
) -> EngineError {
    EngineError::RecoveryInconsistency {
        resource,
        reservation,
        reason: reason.into(),
    }
}

impl Engine {
    /// Reconcile persisted reservations with elapsed wall-clock time.
    ///
    /// Overdue rows are completed, which also forces the relay off in case it
    /// stayed on through the downtime. Pending rows get a timer for the
    /// remaining time and the relay switched back on. Runs before `start`
    /// opens the engine to traffic.
    pub async fn recover_on_startup(self: &Arc<Self>) -> Result<RecoveryReport, EngineError> {
        let rows = self.store.active_reservations().await;
        let now = now_ms();
        let mut report = RecoveryReport::default();
        info!(active = rows.len(), "recovery sweep started");

        for row in rows {
            if row.is_due(now) {
                let completion = self.complete(row.resource_id, row.id).await;
                if completion.converged() {
                    metrics::counter!(crate::observability::RECOVERY_ROWS_TOTAL, "action" => "completed")
                        .increment(1);
                    report.completed.push(row.id);
                } else {
                    let e = inconsistency(
                        row.resource_id,
                        Some(row.id),
                        format!("overdue reservation did not fully complete: {completion:?}"),
                    );
                    self.flag(&e, row.resource_id);
                    report.inconsistencies.push(e);
                }
            } else {
                match self.resume(&row, now).await {
                    Ok(()) => {
                        metrics::counter!(crate::observability::RECOVERY_ROWS_TOTAL, "action" => "rearmed")
                            .increment(1);
                        report.rearmed.push(row.id);
                    }
                    Err(e) => {
                        self.flag(&e, row.resource_id);
                        report.inconsistencies.push(e);
                    }
                }
            }
        }

        let orphans: Vec<ResourceId> = {
            let tables = self.store.read().await;
            tables
                .resources
                .values()
                .filter(|p| p.busy && tables.active_for_resource(p.id).next().is_none())
                .map(|p| p.id)
                .collect()
        };
        for resource_id in orphans {
            match self.release_orphan(resource_id).await {
                Ok(()) => {
                    metrics::counter!(crate::observability::RECOVERY_ROWS_TOTAL, "action" => "released")
                        .increment(1);
                    report.released.push(resource_id);
                }
                Err(e) => {
                    self.flag(&e, resource_id);
                    report.inconsistencies.push(e);
                }
            }
        }

        info!(
            completed = report.completed.len(),
            rearmed = report.rearmed.len(),
            released = report.released.len(),
            inconsistent = report.inconsistencies.len(),
            "recovery sweep finished"
        );
        Ok(report)
    }

    fn flag(&self, e: &EngineError, resource_id: ResourceId) {
        error!("recovery: {e}");
        metrics::counter!(crate::observability::RECOVERY_ROWS_TOTAL, "action" => "inconsistent")
            .increment(1);
        self.quarantine(resource_id, e.to_string());
    }

    /// Take ownership of a reservation that is still running.
    async fn resume(self: &Arc<Self>, row: &Reservation, now: Ms) -> Result<(), EngineError> {
        let mut tx = self.store.begin().await;
        let resource = tx
            .resource(row.resource_id)
            .cloned()
            .ok_or_else(|| inconsistency(row.resource_id, Some(row.id), "resource row missing"))?;
        if resource.busy {
            drop(tx);
        } else {
            warn!(resource_id = row.resource_id, reservation_id = row.id, "active reservation on a free resource, marking busy");
            tx.put_resource(Resource { busy: true, ..resource });
            tx.commit().await.map_err(|e| {
                inconsistency(row.resource_id, Some(row.id), format!("could not mark busy: {e}"))
            })?;
        }

        // Armed even if the relay refuses, so the reservation still ends and
        // the relay gets a turn-off attempt on time.
        self.arm_expiry(row, Duration::from_millis(row.remaining_ms(now) as u64))
            .await;

        self.actuator.turn_on(row.resource_id).await.map_err(|e| {
            metrics::counter!(crate::observability::ACTUATION_FAILURES_TOTAL, "op" => "on")
                .increment(1);
            inconsistency(row.resource_id, Some(row.id), format!("could not power back on: {e}"))
        })?;
        info!(
            resource_id = row.resource_id,
            reservation_id = row.id,
            remaining_ms = row.remaining_ms(now),
            "reservation resumed"
        );
        Ok(())
    }

    /// Free a printer left busy without an active reservation.
    async fn release_orphan(&self, resource_id: ResourceId) -> Result<(), EngineError> {
        self.actuator.turn_off(resource_id).await.map_err(|e| {
            metrics::counter!(crate::observability::ACTUATION_FAILURES_TOTAL, "op" => "off")
                .increment(1);
            inconsistency(resource_id, None, format!("could not power off orphaned resource: {e}"))
        })?;
        let mut tx = self.store.begin().await;
        let held = tx.is_held(resource_id);
        if let Some(p) = tx.resource(resource_id).cloned().filter(|_| !held) {
            tx.put_resource(Resource { busy: false, ..p });
        }
        tx.commit()
            .await
            .map_err(|e| inconsistency(resource_id, None, format!("could not mark free: {e}")))?;
        warn!(resource_id, "released resource that was busy without an active reservation");
        Ok(())
    }
}
