use ulid::Ulid;

use crate::model::*;

use super::ledger::Ledger;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

pub(crate) fn validate_window(window: &Window) -> Result<(), EngineError> {
    use crate::limits::*;
    if window.start() < MIN_VALID_TIMESTAMP_MS || window.end() > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Overlaps the named appointment, which still holds its window.
    DoubleBooked(Ulid),
    OutsideAvailability,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admissible,
    Conflict(ConflictReason),
}

impl Admission {
    pub fn is_admissible(&self) -> bool {
        matches!(self, Admission::Admissible)
    }

    pub fn into_result(self, window: Window) -> Result<(), EngineError> {
        match self {
            Admission::Admissible => Ok(()),
            Admission::Conflict(reason) => Err(EngineError::from_conflict(reason, window)),
        }
    }
}

/// Decide whether `provider_id` can take `window`.
///
/// Appointment clashes are checked before availability, so a window failing
/// both reports `DoubleBooked`. `exclude` drops one appointment from the
/// clash set (the one being rescheduled). Appointments for other providers
/// in `existing` are ignored.
pub fn can_book<'a>(
    provider_id: Ulid,
    window: &Window,
    existing: impl IntoIterator<Item = &'a Appointment>,
    ledger: &Ledger,
    exclude: Option<Ulid>,
) -> Admission {
    let clash = existing.into_iter().find(|a| {
        a.provider_id == provider_id
            && Some(a.id) != exclude
            && a.status.holds_window()
            && a.window.overlaps(window)
    });
    if let Some(other) = clash {
        return Admission::Conflict(ConflictReason::DoubleBooked(other.id));
    }
    if !ledger.is_available(window) {
        return Admission::Conflict(ConflictReason::OutsideAvailability);
    }
    Admission::Admissible
}
