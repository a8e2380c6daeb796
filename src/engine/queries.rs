use crate::model::*;

use super::Engine;

impl Engine {
    /// Every active reservation with printer and user names, newest first.
    pub async fn list_active_reservations(&self) -> Vec<ReservationView> {
        let tables = self.store.read().await;
        let mut out: Vec<ReservationView> =
            tables.active_reservations().map(|r| tables.view(r)).collect();
        out.sort_by(|a, b| b.reserved_at.cmp(&a.reserved_at).then(b.id.cmp(&a.id)));
        out
    }

    /// A user's reservation history, newest first.
    pub async fn user_reservations(&self, user_id: UserId, active_only: bool) -> Vec<ReservationView> {
        let tables = self.store.read().await;
        let mut out: Vec<ReservationView> = tables
            .reservations
            .values()
            .filter(|r| r.user_id == user_id && (r.active || !active_only))
            .map(|r| tables.view(r))
            .collect();
        out.sort_by(|a, b| b.reserved_at.cmp(&a.reserved_at).then(b.id.cmp(&a.id)));
        out
    }

    /// The printer directory, ordered by id.
    pub async fn resources(&self) -> Vec<Resource> {
        self.store.read().await.resources.values().cloned().collect()
    }

    /// Timers held by this process, soonest first.
    pub async fn scheduled_expiries(&self) -> Vec<ScheduledExpiry> {
        self.schedule.snapshot().await
    }
}
