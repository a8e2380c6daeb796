use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Which steps of a completion went through. Failed steps were logged;
/// completion never returns an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionReport {
    pub powered_off: bool,
    /// Another active reservation held the printer, so power was left on.
    pub superseded: bool,
    pub resource_released: bool,
    pub reservation_closed: bool,
    /// False when there was no schedule entry: the timer claimed it on firing,
    /// an earlier completion removed it, or this process never armed one.
    pub unscheduled: bool,
}

impl CompletionReport {
    /// Every bookkeeping and actuation step succeeded. A skipped power-off
    /// counts as done.
    pub fn converged(&self) -> bool {
        (self.powered_off || self.superseded) && self.resource_released && self.reservation_closed
    }
}

fn validate_minutes(minutes: i64) -> Result<(), EngineError> {
    if minutes <= 0 || minutes > MAX_RESERVATION_MINUTES {
        return Err(EngineError::InvalidDuration {
            minutes,
            max: MAX_RESERVATION_MINUTES,
        });
    }
    Ok(())
}

impl Engine {
    /// Reserve a printer for `minutes`, power it on and schedule its end.
    ///
    /// Checks, first failure wins: duration, resource exists, resource free,
    /// user below the active-reservation limit. Then user exists, not banned,
    /// allowed on privileged printers, printer not quarantined. The busy flip,
    /// reservation insert and quota debit commit as one transaction; a failed
    /// power-on is compensated by restoring the exact prior rows.
    pub async fn reserve(
        self: &Arc<Self>,
        resource_id: ResourceId,
        user_id: UserId,
        minutes: i64,
    ) -> Result<ReservationId, EngineError> {
        self.ensure_ready()?;
        let started = Instant::now();
        let result = self.reserve_inner(resource_id, user_id, minutes).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => kind_label(e),
        };
        metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => outcome)
            .increment(1);
        metrics::histogram!(crate::observability::RESERVE_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn reserve_inner(
        self: &Arc<Self>,
        resource_id: ResourceId,
        user_id: UserId,
        minutes: i64,
    ) -> Result<ReservationId, EngineError> {
        validate_minutes(minutes)?;
        if self.store.resource(resource_id).await.is_none() {
            return Err(EngineError::UnknownResource(resource_id));
        }

        // Held across check, commit and actuation so two callers can't both
        // see the printer free.
        let _lock = self.lock_resource(resource_id).await;
        // Read before taking the writer lock; a cold cache goes to the store.
        let limit = self.quota.max_active_reservations().await;
        let now = now_ms();

        let mut tx = self.store.begin().await;
        let resource = tx
            .resource(resource_id)
            .cloned()
            .ok_or(EngineError::UnknownResource(resource_id))?;
        if resource.busy || tx.is_held(resource_id) {
            return Err(EngineError::ResourceBusy(resource_id));
        }
        if tx.active_count_for_user(user_id) >= limit as usize {
            return Err(EngineError::QuotaExceeded { limit });
        }
        let user = tx
            .user(user_id)
            .cloned()
            .ok_or(EngineError::UnknownUser(user_id))?;
        if user.is_banned(now) {
            return Err(EngineError::UserBanned(user_id));
        }
        if resource.privileged && !user.admin && !user.privileged_access {
            return Err(EngineError::NotPermitted {
                user: user_id,
                resource: resource_id,
            });
        }
        if self.is_quarantined(resource_id) {
            return Err(EngineError::ResourceUnavailable(resource_id));
        }

        let complete_at = now + minutes * MINUTE_MS;
        tx.put_resource(Resource {
            busy: true,
            last_holder: Some(user.display_name.clone()),
            ..resource.clone()
        });
        let reservation_id =
            tx.insert_reservation(resource_id, user_id, now, complete_at, resource.group.clone());
        tx.put_user(User {
            weekly_quota_minutes: user.weekly_quota_minutes - minutes,
            ..user.clone()
        });
        tx.commit().await?;

        if let Err(e) = self.actuator.turn_on(resource_id).await {
            metrics::counter!(crate::observability::ACTUATION_FAILURES_TOTAL, "op" => "on")
                .increment(1);
            warn!(resource_id, reservation_id, "power on failed, rolling back: {e}");
            return Err(self
                .undo_reservation(&resource, &user, reservation_id, e)
                .await);
        }

        let reservation = Reservation {
            id: reservation_id,
            resource_id,
            user_id,
            reserved_at: now,
            complete_at,
            active: true,
            scope: resource.group,
        };
        self.arm_expiry(&reservation, Duration::from_millis((minutes * MINUTE_MS) as u64))
            .await;
        info!(resource_id, user_id, reservation_id, minutes, "reservation started");
        Ok(reservation_id)
    }

    /// Compensating transaction after a failed power-on: free the printer with
    /// its previous holder label, close the reservation and put the user's
    /// balance back to the exact pre-debit value.
    async fn undo_reservation(
        &self,
        prior_resource: &Resource,
        prior_user: &User,
        reservation_id: ReservationId,
        cause: crate::actuation::ActuationError,
    ) -> EngineError {
        let resource_id = prior_resource.id;
        let mut tx = self.store.begin().await;
        if let Some(current) = tx.resource(resource_id).cloned() {
            tx.put_resource(Resource {
                busy: prior_resource.busy,
                last_holder: prior_resource.last_holder.clone(),
                ..current
            });
        }
        if let Some(r) = tx.reservation(reservation_id).cloned() {
            tx.put_reservation(Reservation { active: false, ..r });
        }
        if let Some(current) = tx.user(prior_user.id).cloned() {
            tx.put_user(User {
                weekly_quota_minutes: prior_user.weekly_quota_minutes,
                ..current
            });
        }
        match tx.commit().await {
            Ok(()) => {
                metrics::counter!(crate::observability::ROLLBACKS_TOTAL, "outcome" => "ok")
                    .increment(1);
                info!(resource_id, reservation_id, "reservation rolled back after power-on failure");
                EngineError::Actuation {
                    resource: resource_id,
                    source: cause,
                }
            }
            Err(rollback) => {
                metrics::counter!(crate::observability::ROLLBACKS_TOTAL, "outcome" => "failed")
                    .increment(1);
                error!(
                    resource_id,
                    reservation_id,
                    "CRITICAL: rollback after power-on failure did not commit: {rollback}; manual intervention required"
                );
                self.quarantine(
                    resource_id,
                    format!("rollback of reservation {reservation_id} failed: {rollback}"),
                );
                EngineError::RollbackFailed {
                    resource: resource_id,
                    rollback,
                }
            }
        }
    }

    /// End a reservation: power off, free the printer, close the row, drop the
    /// timer. Every step is attempted even if an earlier one fails; running it
    /// again is harmless.
    pub async fn complete(
        &self,
        resource_id: ResourceId,
        reservation_id: ReservationId,
    ) -> CompletionReport {
        let _lock = self.lock_resource(resource_id).await;
        self.complete_locked(resource_id, reservation_id).await
    }

    /// Timer path. Does nothing if a cancel or an earlier completion already
    /// closed the reservation.
    pub(super) async fn expire(&self, resource_id: ResourceId, reservation_id: ReservationId) {
        let _lock = self.lock_resource(resource_id).await;
        let active = self
            .store
            .reservation(reservation_id)
            .await
            .is_some_and(|r| r.active);
        if !active {
            debug!(resource_id, reservation_id, "expired reservation already closed");
            return;
        }
        metrics::counter!(crate::observability::COMPLETIONS_TOTAL, "trigger" => "timer")
            .increment(1);
        self.complete_locked(resource_id, reservation_id).await;
    }

    /// Caller holds the resource lock.
    async fn complete_locked(
        &self,
        resource_id: ResourceId,
        reservation_id: ReservationId,
    ) -> CompletionReport {
        // The relay belongs to whichever reservation is active on it now.
        let superseded = self
            .store
            .read()
            .await
            .active_for_resource(resource_id)
            .any(|r| r.id != reservation_id);
        let powered_off = if superseded {
            debug!(resource_id, reservation_id, "printer held by a newer reservation, leaving power on");
            false
        } else {
            match self.actuator.turn_off(resource_id).await {
                Ok(()) => true,
                Err(e) => {
                    metrics::counter!(crate::observability::ACTUATION_FAILURES_TOTAL, "op" => "off")
                        .increment(1);
                    warn!(resource_id, reservation_id, "failed to power off: {e}");
                    false
                }
            }
        };

        let resource_released = {
            let mut tx = self.store.begin().await;
            match tx.resource(resource_id).cloned() {
                // A newer reservation may already hold it if this is a late repeat.
                Some(r) if r.busy && !tx.held_by_other(resource_id, reservation_id) => {
                    tx.put_resource(Resource { busy: false, ..r });
                    tx.commit().await
                }
                _ => Ok(()),
            }
        };
        let resource_released = match resource_released {
            Ok(()) => true,
            Err(e) => {
                warn!(resource_id, reservation_id, "failed to mark resource free: {e}");
                false
            }
        };

        let reservation_closed = {
            let mut tx = self.store.begin().await;
            match tx.reservation(reservation_id).cloned() {
                Some(r) if r.active => {
                    tx.put_reservation(Reservation { active: false, ..r });
                    tx.commit().await
                }
                _ => Ok(()),
            }
        };
        let reservation_closed = match reservation_closed {
            Ok(()) => true,
            Err(e) => {
                warn!(resource_id, reservation_id, "failed to close reservation: {e}");
                false
            }
        };

        let unscheduled = self.schedule.remove(reservation_id).await.is_some();
        if unscheduled {
            info!(resource_id, reservation_id, "reservation completed");
        } else {
            debug!(resource_id, reservation_id, "completed reservation had no schedule entry");
        }

        CompletionReport {
            powered_off,
            superseded,
            resource_released,
            reservation_closed,
            unscheduled,
        }
    }

    /// Cancel an active reservation early, refunding the unused whole minutes
    /// to its owner. Only the owner or an admin may cancel.
    pub async fn cancel(
        &self,
        resource_id: ResourceId,
        reservation_id: ReservationId,
        caller: &Caller,
    ) -> Result<bool, EngineError> {
        self.ensure_ready()?;
        let _lock = self.lock_resource(resource_id).await;

        let refunded = {
            let mut tx = self.store.begin().await;
            let reservation = tx
                .reservation(reservation_id)
                .filter(|r| r.resource_id == resource_id)
                .cloned()
                .ok_or(EngineError::ReservationNotFound(reservation_id))?;
            if !reservation.active {
                return Err(EngineError::AlreadyCompleted(reservation_id));
            }
            if !caller.admin && caller.user_id != reservation.user_id {
                return Err(EngineError::NotOwner {
                    user: caller.user_id,
                    reservation: reservation_id,
                });
            }
            let owner = tx
                .user(reservation.user_id)
                .cloned()
                .ok_or(EngineError::UnknownUser(reservation.user_id))?;
            let refund = reservation.remaining_ms(now_ms()) / MINUTE_MS;
            tx.put_user(User {
                weekly_quota_minutes: owner.weekly_quota_minutes + refund,
                ..owner
            });
            tx.commit().await?;
            refund
        };

        metrics::counter!(crate::observability::CANCELLATIONS_TOTAL).increment(1);
        metrics::counter!(crate::observability::COMPLETIONS_TOTAL, "trigger" => "cancel")
            .increment(1);
        info!(resource_id, reservation_id, refunded, by = caller.user_id, "reservation cancelled");
        self.complete_locked(resource_id, reservation_id).await;
        Ok(true)
    }
}

fn kind_label(e: &EngineError) -> &'static str {
    use super::ErrorKind::*;
    match e.kind() {
        Validation => "validation",
        Conflict => "conflict",
        NotFound => "not_found",
        AlreadyCompleted => "already_completed",
        Forbidden => "forbidden",
        Actuation => "actuation",
        Persistence => "persistence",
        RecoveryInconsistency => "recovery_inconsistency",
        NotReady => "not_ready",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minutes_bounds() {
        assert!(validate_minutes(1).is_ok());
        assert!(validate_minutes(MAX_RESERVATION_MINUTES).is_ok());
        assert!(matches!(
            validate_minutes(0),
            Err(EngineError::InvalidDuration { minutes: 0, .. })
        ));
        assert!(validate_minutes(-5).is_err());
        assert!(validate_minutes(MAX_RESERVATION_MINUTES + 1).is_err());
    }

    #[test]
    fn convergence_requires_all_steps() {
        let full = CompletionReport {
            powered_off: true,
            superseded: false,
            resource_released: true,
            reservation_closed: true,
            unscheduled: false,
        };
        assert!(full.converged());
        assert!(!CompletionReport { powered_off: false, ..full }.converged());
        assert!(CompletionReport { powered_off: false, superseded: true, ..full }.converged());
        assert!(!CompletionReport { reservation_closed: false, ..full }.converged());
    }
}
