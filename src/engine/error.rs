use ulid::Ulid;

use crate::model::{ReservationStatus, Transition, Unbookable};

/// Coarse classification callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthenticated,
    Unauthorized,
    NotFound,
    InvalidInput,
    SchedulingConflict,
    InvalidStateTransition,
    ExpiredOrInvalidCode,
    StorageFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::SchedulingConflict => "scheduling_conflict",
            ErrorKind::InvalidStateTransition => "invalid_state_transition",
            ErrorKind::ExpiredOrInvalidCode => "expired_or_invalid_code",
            ErrorKind::StorageFailure => "storage_failure",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(&'static str),
    #[error("not permitted: {0}")]
    Unauthorized(&'static str),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("vehicle unavailable: {0}")]
    Unavailable(&'static str),
    #[error("no availability window covers the requested time range")]
    NoAvailabilityWindow,
    #[error("scheduling conflict with reservation {0}")]
    SchedulingConflict(Ulid),
    #[error("cannot {transition} a reservation that is {from}")]
    InvalidStateTransition {
        from: ReservationStatus,
        transition: Transition,
    },
    #[error("handover code is invalid or expired")]
    ExpiredOrInvalidCode,
    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            EngineError::Unauthorized(_) => ErrorKind::Unauthorized,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::InvalidInput(_)
            | EngineError::AlreadyExists(_)
            | EngineError::LimitExceeded(_)
            | EngineError::Unavailable(_) => ErrorKind::InvalidInput,
            EngineError::NoAvailabilityWindow | EngineError::SchedulingConflict(_) => {
                ErrorKind::SchedulingConflict
            }
            EngineError::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            EngineError::ExpiredOrInvalidCode => ErrorKind::ExpiredOrInvalidCode,
            EngineError::StorageFailure(_) => ErrorKind::StorageFailure,
        }
    }

    /// Stable SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::Unauthenticated(_) => "28000",
            EngineError::Unauthorized(_) => "42501",
            EngineError::NotFound(_) => "P0002",
            EngineError::InvalidInput(_) => "22023",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::Unavailable(_) => "RS001",
            EngineError::NoAvailabilityWindow => "RS002",
            EngineError::SchedulingConflict(_) => "23P01",
            EngineError::InvalidStateTransition { .. } => "RS003",
            EngineError::ExpiredOrInvalidCode => "RS004",
            EngineError::StorageFailure(_) => "58030",
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidInput(msg.into())
    }
}

impl From<Unbookable> for EngineError {
    fn from(u: Unbookable) -> Self {
        match u {
            Unbookable::Unavailable(why) => EngineError::Unavailable(why),
            Unbookable::NoAvailabilityWindow => EngineError::NoAvailabilityWindow,
            Unbookable::Conflict(id) => EngineError::SchedulingConflict(id),
        }
    }
}
