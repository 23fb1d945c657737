use ulid::Ulid;

use crate::model::{Ms, Status, Window};

use super::conflict::ConflictReason;
use super::lifecycle::Action;

#[derive(Debug)]
pub enum EngineError {
    InvalidWindow { start: Ms, end: Ms },
    /// A declaration overlaps the named existing entry (or itself, for recurrences).
    OverlapConflict(Ulid),
    /// The window overlaps the named active appointment.
    DoubleBooked(Ulid),
    OutsideAvailability(Window),
    InvalidTransition {
        id: Ulid,
        from: Status,
        action: Action,
    },
    NotFound(Ulid),
    /// The provider's lock was not acquired within the configured timeout.
    Busy(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub(crate) fn from_conflict(reason: ConflictReason, window: Window) -> Self {
        match reason {
            ConflictReason::DoubleBooked(existing) => EngineError::DoubleBooked(existing),
            ConflictReason::OutsideAvailability => EngineError::OutsideAvailability(window),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidWindow { start, end } => {
                write!(f, "invalid window: end {end} is not after start {start}")
            }
            EngineError::OverlapConflict(id) => {
                write!(f, "availability overlaps existing entry: {id}")
            }
            EngineError::DoubleBooked(id) => write!(f, "double booked with appointment: {id}"),
            EngineError::OutsideAvailability(window) => {
                write!(f, "window {window} is outside the provider's availability")
            }
            EngineError::InvalidTransition { id, from, action } => {
                write!(f, "cannot {action} appointment {id} in status {from}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Busy(id) => write!(f, "provider {id} is busy, try again"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
