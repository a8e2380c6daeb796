use std::collections::BTreeMap;

use crate::model::*;

/// The relational state rebuilt from the WAL. Reads go straight to these maps;
/// writes only happen through a [`Transaction`](super::Transaction) or replay.
#[derive(Debug, Clone, PartialEq)]
pub struct Tables {
    pub resources: BTreeMap<ResourceId, Resource>,
    pub users: BTreeMap<UserId, User>,
    pub reservations: BTreeMap<ReservationId, Reservation>,
    /// `None` until an administrator sets one.
    pub quota_limit: Option<u32>,
    pub next_reservation_id: ReservationId,
}

/// Previous value of whatever a mutation touched.
#[derive(Debug)]
pub(super) enum Undo {
    Resource(ResourceId, Option<Resource>),
    User(UserId, Option<User>),
    Reservation(ReservationId, Option<Reservation>),
    QuotaLimit(Option<u32>),
    NextId(ReservationId),
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            resources: BTreeMap::new(),
            users: BTreeMap::new(),
            reservations: BTreeMap::new(),
            quota_limit: None,
            next_reservation_id: 1,
        }
    }
}

impl Tables {
    pub fn resource(&self, id: ResourceId) -> Option<&Resource> {
        self.resources.get(&id)
    }

    pub fn user(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn reservation(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.get(&id)
    }

    pub fn active_reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values().filter(|r| r.active)
    }

    pub fn active_for_resource(&self, resource_id: ResourceId) -> impl Iterator<Item = &Reservation> {
        self.active_reservations()
            .filter(move |r| r.resource_id == resource_id)
    }

    pub fn active_count_for_user(&self, user_id: UserId) -> usize {
        self.active_reservations()
            .filter(|r| r.user_id == user_id)
            .count()
    }

    pub fn view(&self, r: &Reservation) -> ReservationView {
        ReservationView {
            id: r.id,
            resource_id: r.resource_id,
            resource_name: self.resource(r.resource_id).map(|p| p.name.clone()),
            user_id: r.user_id,
            user_name: self.user(r.user_id).map(|u| u.display_name.clone()),
            reserved_at: r.reserved_at,
            complete_at: r.complete_at,
            active: r.active,
            scope: r.scope.clone(),
        }
    }

    /// Apply one mutation, pushing what it overwrote onto `undo`.
    pub(super) fn apply(&mut self, mutation: &Mutation, undo: &mut Vec<Undo>) {
        match mutation {
            Mutation::ResourcePut(r) => {
                let prev = self.resources.insert(r.id, r.clone());
                undo.push(Undo::Resource(r.id, prev));
            }
            Mutation::ResourceDeleted { id } => {
                let prev = self.resources.remove(id);
                undo.push(Undo::Resource(*id, prev));
                let history: Vec<ReservationId> = self
                    .reservations
                    .values()
                    .filter(|r| r.resource_id == *id)
                    .map(|r| r.id)
                    .collect();
                for rid in history {
                    let prev = self.reservations.remove(&rid);
                    undo.push(Undo::Reservation(rid, prev));
                }
            }
            Mutation::UserPut(u) => {
                let prev = self.users.insert(u.id, u.clone());
                undo.push(Undo::User(u.id, prev));
            }
            Mutation::ReservationPut(r) => {
                if r.id >= self.next_reservation_id {
                    undo.push(Undo::NextId(self.next_reservation_id));
                    self.next_reservation_id = r.id + 1;
                }
                let prev = self.reservations.insert(r.id, r.clone());
                undo.push(Undo::Reservation(r.id, prev));
            }
            Mutation::QuotaLimitSet { limit } => {
                undo.push(Undo::QuotaLimit(self.quota_limit));
                self.quota_limit = Some(*limit);
            }
            Mutation::ReservationIdFloor { next } => {
                if *next > self.next_reservation_id {
                    undo.push(Undo::NextId(self.next_reservation_id));
                    self.next_reservation_id = *next;
                }
            }
        }
    }

    /// Unwind an undo log, newest entry first.
    pub(super) fn revert(&mut self, undo: Vec<Undo>) {
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Resource(id, Some(r)) => {
                    self.resources.insert(id, r);
                }
                Undo::Resource(id, None) => {
                    self.resources.remove(&id);
                }
                Undo::User(id, Some(u)) => {
                    self.users.insert(id, u);
                }
                Undo::User(id, None) => {
                    self.users.remove(&id);
                }
                Undo::Reservation(id, Some(r)) => {
                    self.reservations.insert(id, r);
                }
                Undo::Reservation(id, None) => {
                    self.reservations.remove(&id);
                }
                Undo::QuotaLimit(prev) => self.quota_limit = prev,
                Undo::NextId(prev) => self.next_reservation_id = prev,
            }
        }
    }

    /// Minimal commit that recreates the current state from empty.
    pub fn snapshot(&self) -> Commit {
        let mut mutations = Vec::with_capacity(
            self.resources.len() + self.users.len() + self.reservations.len() + 2,
        );
        mutations.extend(self.resources.values().cloned().map(Mutation::ResourcePut));
        mutations.extend(self.users.values().cloned().map(Mutation::UserPut));
        mutations.extend(self.reservations.values().cloned().map(Mutation::ReservationPut));
        if let Some(limit) = self.quota_limit {
            mutations.push(Mutation::QuotaLimitSet { limit });
        }
        mutations.push(Mutation::ReservationIdFloor {
            next: self.next_reservation_id,
        });
        Commit { mutations }
    }
}
