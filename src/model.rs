use serde::{Deserialize, Serialize};

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Printer id. Doubles as the actuation channel number.
pub type ResourceId = u32;
pub type UserId = u32;
/// Assigned by the store on insert, never reused.
pub type ReservationId = u64;

/// A printer slot bound to one physical relay channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    /// Partition label, e.g. the lab a printer belongs to.
    pub group: String,
    pub busy: bool,
    /// Display name of the most recent holder.
    pub last_holder: Option<String>,
    /// Restricted to admins and users with privileged access.
    pub privileged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub trained: bool,
    pub admin: bool,
    pub privileged_access: bool,
    pub scope: String,
    pub ban_until: Option<Ms>,
    /// Only ever changed by a reserve debit, a cancel refund or a rollback.
    pub weekly_quota_minutes: i64,
}

impl User {
    pub fn is_banned(&self, now: Ms) -> bool {
        self.ban_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub resource_id: ResourceId,
    pub user_id: UserId,
    pub reserved_at: Ms,
    pub complete_at: Ms,
    pub active: bool,
    /// Copied from the resource's group at creation.
    pub scope: String,
}

impl Reservation {
    pub fn remaining_ms(&self, now: Ms) -> Ms {
        (self.complete_at - now).max(0)
    }

    pub fn is_due(&self, now: Ms) -> bool {
        self.complete_at <= now
    }
}

/// The authenticated party behind a call, as resolved by the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
    pub admin: bool,
    pub lab_scope: bool,
}

impl Caller {
    pub fn user(user_id: UserId) -> Self {
        Self { user_id, admin: false, lab_scope: false }
    }

    pub fn admin(user_id: UserId) -> Self {
        Self { user_id, admin: true, lab_scope: false }
    }
}

/// Row-level changes carried in the WAL. Puts carry the full row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    ResourcePut(Resource),
    /// Deletes the resource and its whole reservation history.
    ResourceDeleted { id: ResourceId },
    UserPut(User),
    ReservationPut(Reservation),
    QuotaLimitSet { limit: u32 },
    /// Keeps ids monotonic across compaction after history deletes.
    ReservationIdFloor { next: ReservationId },
}

/// One committed transaction. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub mutations: Vec<Mutation>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationView {
    pub id: ReservationId,
    pub resource_id: ResourceId,
    pub resource_name: Option<String>,
    pub user_id: UserId,
    pub user_name: Option<String>,
    pub reserved_at: Ms,
    pub complete_at: Ms,
    pub active: bool,
    pub scope: String,
}

/// In-memory expiry entry, for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledExpiry {
    pub reservation_id: ReservationId,
    pub resource_id: ResourceId,
    pub user_id: UserId,
    pub complete_at: Ms,
}

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}
