use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{can_book, validate_window};
use super::lifecycle::{advance, Action};
use super::{Engine, EngineError, WalCommand};

/// A request to add an entry to a provider's availability ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub provider_id: Ulid,
    pub window: Window,
    pub kind: EntryKind,
    pub recurrence: Option<Recurrence>,
    pub reason: Option<String>,
}

impl Declaration {
    pub fn new(provider_id: Ulid, window: Window, kind: EntryKind) -> Self {
        Self {
            provider_id,
            window,
            kind,
            recurrence: None,
            reason: None,
        }
    }

    pub fn repeating(mut self, frequency: Frequency, count: u32) -> Self {
        self.recurrence = Some(Recurrence { frequency, count });
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

fn check_len(value: &Option<String>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(s) if s.chars().count() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn validate_declaration(decl: &Declaration, id: Ulid) -> Result<(), EngineError> {
    validate_window(&decl.window)?;
    if decl.window.duration_ms() > MAX_ENTRY_DURATION_MS {
        return Err(EngineError::LimitExceeded("availability entry too long"));
    }
    check_len(&decl.reason, MAX_ENTRY_REASON_LEN, "availability reason too long")?;
    if let Some(r) = decl.recurrence {
        if r.count == 0 || r.count > MAX_RECURRENCE_COUNT {
            return Err(EngineError::LimitExceeded("recurrence count out of range"));
        }
        let last = decl.window.shifted((r.count as Ms - 1) * r.frequency.period_ms())?;
        validate_window(&last)?;
        if r.count > 1 && decl.window.duration_ms() > r.frequency.period_ms() {
            return Err(EngineError::OverlapConflict(id));
        }
    }
    Ok(())
}

fn validate_booking(req: &BookingRequest) -> Result<(), EngineError> {
    validate_window(&req.window)?;
    if req.window.duration_ms() > MAX_APPOINTMENT_DURATION_MS {
        return Err(EngineError::LimitExceeded("appointment too long"));
    }
    check_len(&req.visit_type, MAX_VISIT_TYPE_LEN, "visit type too long")?;
    check_len(&req.reason, MAX_REASON_LEN, "appointment reason too long")?;
    check_len(&req.notes, MAX_NOTES_LEN, "appointment notes too long")?;
    Ok(())
}

impl Engine {
    /// Declare a one-off availability entry. Returns the new entry id.
    pub async fn declare(
        &self,
        provider_id: Ulid,
        window: Window,
        kind: EntryKind,
    ) -> Result<Ulid, EngineError> {
        let entry = self
            .declare_entry(Declaration::new(provider_id, window, kind))
            .await?;
        Ok(entry.id)
    }

    /// Add an entry to the provider's ledger. Fails with `OverlapConflict` if
    /// any of its occurrences overlaps an existing one, whatever the kinds.
    pub async fn declare_entry(
        &self,
        decl: Declaration,
    ) -> Result<AvailabilityEntry, EngineError> {
        let id = Ulid::new();
        validate_declaration(&decl, id)?;
        let provider_id = decl.provider_id;
        self.provider_slot(provider_id)?;

        let notice = self
            .with_provider_lock(provider_id, move |ps, now| {
                let entry = AvailabilityEntry {
                    id,
                    provider_id,
                    window: decl.window,
                    kind: decl.kind,
                    recurrence: decl.recurrence,
                    reason: decl.reason,
                    created_at: now,
                };
                if ps.ledger.interval_count() + entry.occurrence_count()
                    > MAX_LEDGER_INTERVALS_PER_PROVIDER
                {
                    return Err(EngineError::LimitExceeded("too many availability entries"));
                }
                ps.ledger.check_declaration(&entry)?;
                Ok(Event::EntryDeclared { entry })
            })
            .await?;

        notice.into_entry().ok_or(EngineError::NotFound(id))
    }

    /// Remove an availability entry and all of its occurrences. Appointments
    /// already booked inside it are left alone.
    pub async fn revoke(&self, entry_id: Ulid) -> Result<AvailabilityEntry, EngineError> {
        let provider_id = self.provider_of(&entry_id)?;
        let notice = self
            .with_provider_lock(provider_id, move |ps, _now| {
                if ps.ledger.entry(&entry_id).is_none() {
                    return Err(EngineError::NotFound(entry_id));
                }
                Ok(Event::EntryRevoked {
                    id: entry_id,
                    provider_id,
                })
            })
            .await?;
        notice.into_entry().ok_or(EngineError::NotFound(entry_id))
    }

    /// Book a new appointment. It starts out `Scheduled`.
    pub async fn create_appointment(
        &self,
        req: BookingRequest,
    ) -> Result<Appointment, EngineError> {
        validate_booking(&req)?;
        let id = Ulid::new();
        let provider_id = req.provider_id;
        let window = req.window;

        // A provider nobody has declared availability for has none.
        let result = if self.get_provider(&provider_id).is_none() {
            Err(EngineError::OutsideAvailability(window))
        } else {
            self.with_provider_lock(provider_id, move |ps, now| {
                if ps.appointments.len() >= MAX_APPOINTMENTS_PER_PROVIDER {
                    return Err(EngineError::LimitExceeded("too many appointments on provider"));
                }
                can_book(
                    provider_id,
                    &window,
                    ps.appointments_overlapping(&window),
                    &ps.ledger,
                    None,
                )
                .into_result(window)?;
                Ok(Event::AppointmentBooked {
                    appointment: Appointment {
                        id,
                        provider_id,
                        client_id: req.client_id,
                        window,
                        status: Status::Scheduled,
                        visit_type: req
                            .visit_type
                            .unwrap_or_else(|| DEFAULT_VISIT_TYPE.to_string()),
                        reason: req.reason,
                        notes: req.notes,
                        created_at: now,
                        updated_at: now,
                    },
                })
            })
            .await
        };

        let outcome = match &result {
            Ok(_) => "booked",
            Err(EngineError::DoubleBooked(_)) => "double_booked",
            Err(EngineError::OutsideAvailability(_)) => "outside_availability",
            Err(EngineError::Busy(_)) => "busy",
            Err(_) => "error",
        };
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => outcome)
            .increment(1);

        let appointment = result?.into_appointment().ok_or(EngineError::NotFound(id))?;
        info!(
            "booked {} for provider {provider_id} at {}",
            appointment.id, appointment.window
        );
        Ok(appointment)
    }

    /// Move an appointment to `new_window`. The appointment's own current
    /// window does not count as a clash. On success the status resets to
    /// `Scheduled`; on failure nothing changes.
    pub async fn reschedule(
        &self,
        id: Ulid,
        new_window: Window,
    ) -> Result<Appointment, EngineError> {
        validate_window(&new_window)?;
        if new_window.duration_ms() > MAX_APPOINTMENT_DURATION_MS {
            return Err(EngineError::LimitExceeded("appointment too long"));
        }
        let provider_id = self.provider_of(&id)?;

        let notice = self
            .with_provider_lock(provider_id, move |ps, now| {
                let current = ps.appointment(&id).ok_or(EngineError::NotFound(id))?;
                advance(current, Action::Reschedule, now)?;
                can_book(
                    provider_id,
                    &new_window,
                    ps.appointments_overlapping(&new_window),
                    &ps.ledger,
                    Some(id),
                )
                .into_result(new_window)?;
                Ok(Event::AppointmentRescheduled {
                    id,
                    provider_id,
                    window: new_window,
                    at: now,
                })
            })
            .await?;

        metrics::counter!(
            crate::observability::TRANSITIONS_TOTAL,
            "action" => Action::Reschedule.as_str()
        )
        .increment(1);
        info!("rescheduled {id} to {new_window}");
        notice.into_appointment().ok_or(EngineError::NotFound(id))
    }

    pub async fn confirm(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, Action::Confirm).await
    }

    pub async fn begin(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, Action::Begin).await
    }

    pub async fn complete(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, Action::Complete).await
    }

    pub async fn cancel(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, Action::Cancel).await
    }

    pub async fn mark_no_show(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, Action::MarkNoShow).await
    }

    /// Status-only lifecycle step under the provider lock.
    async fn transition(&self, id: Ulid, action: Action) -> Result<Appointment, EngineError> {
        let provider_id = self.provider_of(&id)?;
        let notice = self
            .with_provider_lock(provider_id, move |ps, now| {
                let current = ps.appointment(&id).ok_or(EngineError::NotFound(id))?;
                let status = advance(current, action, now)?;
                Ok(Event::StatusChanged {
                    id,
                    provider_id,
                    status,
                    at: now,
                })
            })
            .await?;

        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "action" => action.as_str())
            .increment(1);
        let appointment = notice.into_appointment().ok_or(EngineError::NotFound(id))?;
        info!("{action} {id}: now {}", appointment.status);
        Ok(appointment)
    }

    /// Scheduled or confirmed appointments whose window ended at or before
    /// `now - grace`. Providers busy at the time of the scan are skipped
    /// until the next one.
    pub fn collect_overdue(&self, now: Ms, grace: Ms) -> Vec<Ulid> {
        let cutoff = now.saturating_sub(grace);
        let mut overdue = Vec::new();
        for entry in self.providers.iter() {
            let ps = entry.value().clone();
            if let Ok(guard) = ps.try_read() {
                overdue.extend(
                    guard
                        .appointments
                        .iter()
                        .filter(|a| {
                            matches!(a.status, Status::Scheduled | Status::Confirmed)
                                && a.window.end() <= cutoff
                        })
                        .map(|a| a.id),
                );
            }
        }
        overdue
    }

    /// Rewrite the journal as the minimal event set recreating current state.
    ///
    /// Commits are held off only while the snapshot is taken. The journal
    /// writer handles commands in order, so anything committed after the gate
    /// opens again lands in the compacted file.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let gate = self.commit_gate.write().await;

        let snapshot: Vec<_> = self.providers.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for ps in snapshot {
            let guard = ps.read().await;
            events.extend(guard.ledger.entries().iter().map(|entry| Event::EntryDeclared {
                entry: entry.clone(),
            }));
            events.extend(guard.appointments.iter().map(|appointment| {
                Event::AppointmentBooked {
                    appointment: appointment.clone(),
                }
            }));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        drop(gate);

        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("compacted journal to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
