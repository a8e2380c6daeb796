use tokio::sync::RwLockWriteGuard;

use crate::model::*;

use super::tables::{Tables, Undo};
use super::{Store, StoreError};

/// A write transaction over the store.
///
/// Holds the single writer lock for its whole life, so no reader ever sees a
/// half-applied transaction. Mutations are applied eagerly with an undo log;
/// `commit` makes them durable as one WAL record. Dropping an uncommitted
/// transaction (including a failed commit) restores the previous state.
pub struct Transaction<'a> {
    pub(super) tables: RwLockWriteGuard<'a, Tables>,
    pub(super) store: &'a Store,
    pub(super) staged: Vec<Mutation>,
    pub(super) undo: Vec<Undo>,
    pub(super) committed: bool,
}

impl<'a> Transaction<'a> {
    pub fn resource(&self, id: ResourceId) -> Option<&Resource> {
        self.tables.resource(id)
    }

    pub fn user(&self, id: UserId) -> Option<&User> {
        self.tables.user(id)
    }

    pub fn reservation(&self, id: ReservationId) -> Option<&Reservation> {
        self.tables.reservation(id)
    }

    pub fn is_held(&self, resource_id: ResourceId) -> bool {
        self.tables.active_for_resource(resource_id).next().is_some()
    }

    pub fn active_count_for_user(&self, user_id: UserId) -> usize {
        self.tables.active_count_for_user(user_id)
    }

    /// True if some active reservation other than `except` holds the resource.
    pub fn held_by_other(&self, resource_id: ResourceId, except: ReservationId) -> bool {
        self.tables
            .active_for_resource(resource_id)
            .any(|r| r.id != except)
    }

    pub fn put_resource(&mut self, resource: Resource) {
        self.stage(Mutation::ResourcePut(resource));
    }

    pub fn put_user(&mut self, user: User) {
        self.stage(Mutation::UserPut(user));
    }

    pub fn put_reservation(&mut self, reservation: Reservation) {
        self.stage(Mutation::ReservationPut(reservation));
    }

    /// Insert an active reservation under the next id from the sequence.
    pub fn insert_reservation(
        &mut self,
        resource_id: ResourceId,
        user_id: UserId,
        reserved_at: Ms,
        complete_at: Ms,
        scope: String,
    ) -> ReservationId {
        let id = self.tables.next_reservation_id;
        self.stage(Mutation::ReservationPut(Reservation {
            id,
            resource_id,
            user_id,
            reserved_at,
            complete_at,
            active: true,
            scope,
        }));
        id
    }

    pub fn delete_resource(&mut self, id: ResourceId) {
        self.stage(Mutation::ResourceDeleted { id });
    }

    pub fn set_quota_limit(&mut self, limit: u32) {
        self.stage(Mutation::QuotaLimitSet { limit });
    }

    fn stage(&mut self, mutation: Mutation) {
        self.tables.apply(&mutation, &mut self.undo);
        self.staged.push(mutation);
    }

    /// Durably commit. On error nothing is visible and nothing is replayed.
    pub async fn commit(mut self) -> Result<(), StoreError> {
        if self.staged.is_empty() {
            self.committed = true;
            return Ok(());
        }
        #[cfg(test)]
        if self.store.take_injected_failure() {
            return Err(StoreError::Injected);
        }
        let commit = Commit {
            mutations: std::mem::take(&mut self.staged),
        };
        self.store.wal_append(commit).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let undo = std::mem::take(&mut self.undo);
            self.tables.revert(undo);
        }
    }
}
