use ulid::Ulid;

use crate::model::{BookingStatus, Ms, OwnerId, SlotKey, Stage};

use super::conflict::Conflict;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    MatchNotFound {
        stage: Stage,
        match_number: u32,
    },
    AlreadyExists(Ulid),
    /// Malformed input. The only hard failure callers are expected to fix.
    Validation(String),
    /// Slot already locked by another owner. The owner is kept for logging
    /// and is not part of the display text.
    LockConflict {
        key: SlotKey,
        owner: OwnerId,
        expires_at: Ms,
    },
    /// Slot already covered by a hold or confirmed booking.
    SlotUnavailable {
        key: SlotKey,
        booking_id: Ulid,
    },
    /// Store-level overlap with an existing booking.
    Conflict(Ulid),
    /// A manual schedule edit collided; nothing was written.
    BatchConflict(Vec<Conflict>),
    /// Caller does not own the lock or booking.
    Forbidden(Ulid),
    InvalidTransition {
        id: Ulid,
        status: BookingStatus,
    },
    LimitExceeded(&'static str),
    /// No reply within the request deadline.
    Timeout,
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::MatchNotFound { stage, match_number } => {
                write!(f, "match not found: {stage:?} #{match_number}")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LockConflict { key, expires_at, .. } => {
                write!(f, "slot {key} is locked by another user until {expires_at}")
            }
            EngineError::SlotUnavailable { key, booking_id } => {
                write!(f, "slot {key} is already booked ({booking_id})")
            }
            EngineError::Conflict(id) => write!(f, "conflict with booking: {id}"),
            EngineError::BatchConflict(conflicts) => {
                write!(f, "schedule edit rejected: {} conflict(s)", conflicts.len())
            }
            EngineError::Forbidden(id) => write!(f, "not owned by caller: {id}"),
            EngineError::InvalidTransition { id, status } => {
                write!(f, "booking {id} cannot change from {status:?}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Timeout => write!(f, "request timed out"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}
