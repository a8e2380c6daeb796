use thiserror::Error;

use crate::actuation::ActuationError;
use crate::model::*;
use crate::store::StoreError;

/// Coarse failure class. Boundary layers map these to status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input or unknown resource/user; nothing changed.
    Validation,
    /// Resource busy/unavailable or quota exhausted; nothing changed.
    Conflict,
    NotFound,
    AlreadyCompleted,
    Forbidden,
    /// Turn-on rejected. Rolled back unless the error says otherwise.
    Actuation,
    /// Store transaction failed; no partial effects.
    Persistence,
    RecoveryInconsistency,
    /// Engine not started, or already closed.
    NotReady,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("reservation length must be between 1 and {max} minutes, got {minutes}")]
    InvalidDuration { minutes: i64, max: i64 },
    #[error("unknown resource: {0}")]
    UnknownResource(ResourceId),
    #[error("unknown user: {0}")]
    UnknownUser(UserId),
    #[error("quota limit must be positive, got {0}")]
    InvalidQuotaLimit(i64),
    #[error("resource {0} is already in use")]
    ResourceBusy(ResourceId),
    #[error("resource {0} is out of service pending manual reconciliation")]
    ResourceUnavailable(ResourceId),
    #[error("maximum of {limit} active reservations per user reached")]
    QuotaExceeded { limit: u32 },
    #[error("cannot delete resource {0}: it has an active reservation")]
    HasActiveReservation(ResourceId),
    #[error("no reservation with id {0}")]
    ReservationNotFound(ReservationId),
    #[error("reservation {0} is not active")]
    AlreadyCompleted(ReservationId),
    #[error("user {0} is banned")]
    UserBanned(UserId),
    #[error("user {user} may not use resource {resource}")]
    NotPermitted { user: UserId, resource: ResourceId },
    #[error("user {user} may not cancel reservation {reservation}")]
    NotOwner { user: UserId, reservation: ReservationId },
    #[error("could not power on resource {resource}, reservation rolled back: {source}")]
    Actuation {
        resource: ResourceId,
        #[source]
        source: ActuationError,
    },
    #[error(
        "could not power on resource {resource} and rollback failed: {rollback}; manual intervention required"
    )]
    RollbackFailed {
        resource: ResourceId,
        rollback: StoreError,
    },
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
    #[error("resource {resource} could not be reconciled (reservation {reservation:?}): {reason}")]
    RecoveryInconsistency {
        resource: ResourceId,
        reservation: Option<ReservationId>,
        reason: String,
    },
    #[error("engine is not accepting requests")]
    NotReady,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidDuration { .. }
            | EngineError::UnknownResource(_)
            | EngineError::UnknownUser(_)
            | EngineError::InvalidQuotaLimit(_) => ErrorKind::Validation,
            EngineError::ResourceBusy(_)
            | EngineError::ResourceUnavailable(_)
            | EngineError::QuotaExceeded { .. }
            | EngineError::HasActiveReservation(_) => ErrorKind::Conflict,
            EngineError::ReservationNotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyCompleted(_) => ErrorKind::AlreadyCompleted,
            EngineError::UserBanned(_)
            | EngineError::NotPermitted { .. }
            | EngineError::NotOwner { .. } => ErrorKind::Forbidden,
            EngineError::Actuation { .. } | EngineError::RollbackFailed { .. } => {
                ErrorKind::Actuation
            }
            EngineError::Persistence(_) => ErrorKind::Persistence,
            EngineError::RecoveryInconsistency { .. } => ErrorKind::RecoveryInconsistency,
            EngineError::NotReady => ErrorKind::NotReady,
        }
    }

    /// Whether the whole call can simply be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Actuation { .. } | EngineError::Persistence(_)
        )
    }
}
