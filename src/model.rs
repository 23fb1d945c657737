use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{EngineError, Ledger};

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`. Always non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    start: Ms,
    end: Ms,
}

impl Window {
    pub fn new(start: Ms, end: Ms) -> Result<Self, EngineError> {
        if end <= start {
            return Err(EngineError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// Bounds the caller has already ordered (clamps, subtractions).
    pub(crate) fn span(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "window start must be before end");
        Self { start, end }
    }

    pub fn start(&self) -> Ms {
        self.start
    }

    pub fn end(&self) -> Ms {
        self.end
    }

    /// Length in milliseconds, saturating at `Ms::MAX` for windows wider than that.
    pub fn duration_ms(&self) -> Ms {
        self.end.saturating_sub(self.start)
    }

    pub fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_window(&self, other: &Window) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// The same window moved by `delta`. Fails if either bound leaves the `Ms` range.
    pub fn shifted(&self, delta: Ms) -> Result<Window, EngineError> {
        match (self.start.checked_add(delta), self.end.checked_add(delta)) {
            (Some(start), Some(end)) => Ok(Window::span(start, end)),
            _ => Err(EngineError::LimitExceeded("window shifted out of range")),
        }
    }

    /// Intersection with `bounds`, or `None` when they do not overlap.
    pub fn clamp_to(&self, bounds: &Window) -> Option<Window> {
        let start = self.start.max(bounds.start);
        let end = self.end.min(bounds.end);
        (start < end).then(|| Window::span(start, end))
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ── Availability ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Available,
    Unavailable,
    Break,
}

impl EntryKind {
    /// Unavailable and break entries close time instead of opening it.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, EntryKind::Available)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    Daily,
    Weekly,
}

impl Frequency {
    pub fn period_ms(&self) -> Ms {
        match self {
            Frequency::Daily => DAY_MS,
            Frequency::Weekly => 7 * DAY_MS,
        }
    }
}

/// Repeat a declaration `count` times, one period apart (the first occurrence included).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub frequency: Frequency,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityEntry {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub window: Window,
    pub kind: EntryKind,
    pub recurrence: Option<Recurrence>,
    pub reason: Option<String>,
    pub created_at: Ms,
}

impl AvailabilityEntry {
    /// Every concrete window this entry occupies, in start order.
    pub fn occurrences(&self) -> impl Iterator<Item = Window> + '_ {
        let (count, period) = match self.recurrence {
            Some(r) => (r.count, r.frequency.period_ms()),
            None => (1, 0),
        };
        // Declarations check their last occurrence is in range.
        (0..count).filter_map(move |i| self.window.shifted(i as Ms * period).ok())
    }

    pub fn occurrence_count(&self) -> usize {
        self.recurrence.map_or(1, |r| r.count as usize)
    }
}

// ── Appointments ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Scheduled,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Scheduled => "SCHEDULED",
            Status::Confirmed => "CONFIRMED",
            Status::InProgress => "IN_PROGRESS",
            Status::Completed => "COMPLETED",
            Status::Cancelled => "CANCELLED",
            Status::NoShow => "NO_SHOW",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Cancelled | Status::NoShow)
    }

    /// Whether an appointment in this status still occupies the provider's time.
    pub fn holds_window(&self) -> bool {
        !matches!(self, Status::Cancelled | Status::NoShow)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const DEFAULT_VISIT_TYPE: &str = "Consultation";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub client_id: Ulid,
    pub window: Window,
    pub status: Status,
    pub visit_type: String,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Everything needed to ask for a booking. Ids come from the identity layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub provider_id: Ulid,
    pub client_id: Ulid,
    pub window: Window,
    pub visit_type: Option<String>,
    pub reason: Option<String>,
    pub notes: Option<String>,
}

impl BookingRequest {
    pub fn new(provider_id: Ulid, client_id: Ulid, window: Window) -> Self {
        Self {
            provider_id,
            client_id,
            window,
            visit_type: None,
            reason: None,
            notes: None,
        }
    }
}

/// A single provider's schedule: its availability ledger plus every appointment
/// ever booked against it (cancelled ones included), sorted by `window.start`.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub id: Ulid,
    pub ledger: Ledger,
    pub appointments: Vec<Appointment>,
}

impl ProviderState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            ledger: Ledger::new(),
            appointments: Vec::new(),
        }
    }

    /// Insert appointment maintaining sort order by window start.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.window.start() <= appointment.window.start());
        self.appointments.insert(pos, appointment);
    }

    pub fn remove_appointment(&mut self, id: &Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == *id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn appointment(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    pub fn appointment_mut(&mut self, id: &Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == *id)
    }

    /// Appointments whose window overlaps `query`, whatever their status.
    pub fn appointments_overlapping(&self, query: &Window) -> impl Iterator<Item = &Appointment> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .appointments
            .partition_point(|a| a.window.start() < query.end());
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.window.end() > query.start())
    }
}

/// The journal record format. One event per committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    EntryDeclared {
        entry: AvailabilityEntry,
    },
    EntryRevoked {
        id: Ulid,
        provider_id: Ulid,
    },
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentRescheduled {
        id: Ulid,
        provider_id: Ulid,
        window: Window,
        at: Ms,
    },
    StatusChanged {
        id: Ulid,
        provider_id: Ulid,
        status: Status,
        at: Ms,
    },
}

impl Event {
    pub fn provider_id(&self) -> Ulid {
        match self {
            Event::EntryDeclared { entry } => entry.provider_id,
            Event::AppointmentBooked { appointment } => appointment.provider_id,
            Event::EntryRevoked { provider_id, .. }
            | Event::AppointmentRescheduled { provider_id, .. }
            | Event::StatusChanged { provider_id, .. } => *provider_id,
        }
    }
}
