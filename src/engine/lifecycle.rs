use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::*;

use super::EngineError;

/// A requested lifecycle step. Booking itself is not an action: it creates
/// the appointment in `Scheduled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Confirm,
    Begin,
    Complete,
    Cancel,
    MarkNoShow,
    Reschedule,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::Confirm,
        Action::Begin,
        Action::Complete,
        Action::Cancel,
        Action::MarkNoShow,
        Action::Reschedule,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Confirm => "confirm",
            Action::Begin => "begin",
            Action::Complete => "complete",
            Action::Cancel => "cancel",
            Action::MarkNoShow => "mark_no_show",
            Action::Reschedule => "reschedule",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status the appointment moves to under `action`, or `InvalidTransition`.
///
/// Begin and complete tolerate skipped steps. Cancel, no-show and reschedule
/// are only open to appointments that have not started. A no-show also needs
/// the window to be over at `now`.
pub fn advance(appointment: &Appointment, action: Action, now: Ms) -> Result<Status, EngineError> {
    use Status::*;

    let next = match (appointment.status, action) {
        (Scheduled, Action::Confirm) => Some(Confirmed),
        (Scheduled | Confirmed, Action::Begin) => Some(InProgress),
        (Scheduled | Confirmed | InProgress, Action::Complete) => Some(Completed),
        (Scheduled | Confirmed, Action::Cancel) => Some(Cancelled),
        (Scheduled | Confirmed, Action::MarkNoShow) if appointment.window.end() <= now => {
            Some(NoShow)
        }
        (Scheduled | Confirmed, Action::Reschedule) => Some(Scheduled),
        _ => None,
    };

    next.ok_or(EngineError::InvalidTransition {
        id: appointment.id,
        from: appointment.status,
        action,
    })
}
