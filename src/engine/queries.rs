use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{can_book, validate_window, Admission};
use super::ledger::{merge_overlapping, subtract_windows, Slots};
use super::{Engine, EngineError};

// Reads take the provider's read lock only long enough to copy out what they
// return. Results can be stale by the time the caller looks at them.

fn validate_range(range: &Window) -> Result<(), EngineError> {
    validate_window(range)?;
    if range.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Engine {
    /// Whether `window` lies fully inside the provider's declared availability.
    /// Existing appointments are not considered; see `check_booking`.
    pub async fn is_available(&self, provider_id: Ulid, window: &Window) -> bool {
        match self.get_provider(&provider_id) {
            Some(ps) => ps.read().await.ledger.is_available(window),
            None => false,
        }
    }

    /// Declared availability in `range` with breaks and unavailability cut
    /// out, ordered by start. Unknown providers have no slots.
    pub async fn available_slots(
        &self,
        provider_id: Ulid,
        range: Window,
    ) -> Result<Slots, EngineError> {
        validate_range(&range)?;
        Ok(match self.get_provider(&provider_id) {
            Some(ps) => ps.read().await.ledger.slots(&range),
            None => Slots::new(Vec::new(), Vec::new()),
        })
    }

    /// Bookable gaps in `range`: available slots minus the windows of
    /// appointments still holding their time, at least `min_duration` long.
    pub async fn open_slots(
        &self,
        provider_id: Ulid,
        range: Window,
        min_duration: Option<Ms>,
    ) -> Result<Vec<Window>, EngineError> {
        validate_range(&range)?;
        let Some(ps) = self.get_provider(&provider_id) else {
            return Ok(Vec::new());
        };
        let guard = ps.read().await;

        let available: Vec<Window> = guard.ledger.slots(&range).collect();
        let taken: Vec<Window> = guard
            .appointments_overlapping(&range)
            .filter(|a| a.status.holds_window())
            .map(|a| a.window)
            .collect();
        drop(guard);

        let mut free = subtract_windows(&available, &merge_overlapping(&taken));
        if let Some(min) = min_duration {
            free.retain(|w| w.duration_ms() >= min);
        }
        Ok(free)
    }

    /// Would booking `window` be admitted right now? A preview only: another
    /// request may take the window before the caller books it.
    pub async fn check_booking(&self, provider_id: Ulid, window: Window) -> Admission {
        match self.get_provider(&provider_id) {
            Some(ps) => {
                let guard = ps.read().await;
                can_book(
                    provider_id,
                    &window,
                    guard.appointments_overlapping(&window),
                    &guard.ledger,
                    None,
                )
            }
            None => can_book(
                provider_id,
                &window,
                std::iter::empty(),
                &Default::default(),
                None,
            ),
        }
    }

    pub async fn appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let provider_id = self.provider_of(&id)?;
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let guard = ps.read().await;
        guard.appointment(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// A provider's appointments ordered by start, optionally only those
    /// overlapping `range`. Cancelled and no-show appointments are included.
    pub async fn provider_appointments(
        &self,
        provider_id: Ulid,
        range: Option<Window>,
    ) -> Result<Vec<Appointment>, EngineError> {
        if let Some(range) = &range {
            validate_range(range)?;
        }
        let Some(ps) = self.get_provider(&provider_id) else {
            return Ok(Vec::new());
        };
        let guard = ps.read().await;
        Ok(match range {
            Some(range) => guard.appointments_overlapping(&range).cloned().collect(),
            None => guard.appointments.clone(),
        })
    }

    /// Every appointment the client holds, across providers, ordered by start.
    pub async fn client_appointments(&self, client_id: Ulid) -> Vec<Appointment> {
        let ids = match self.client_index.get(&client_id) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            // Skip ids whose provider vanished from the map between lookups.
            if let Ok(appointment) = self.appointment(id).await {
                out.push(appointment);
            }
        }
        out.sort_by_key(|a| (a.window.start(), a.id));
        out
    }

    /// Declared entries (not expanded into occurrences), ordered by start.
    pub async fn availability_entries(&self, provider_id: Ulid) -> Vec<AvailabilityEntry> {
        let mut entries = match self.get_provider(&provider_id) {
            Some(ps) => ps.read().await.ledger.entries().to_vec(),
            None => return Vec::new(),
        };
        entries.sort_by_key(|e| (e.window.start(), e.id));
        entries
    }

    /// Providers with any recorded state, in id order.
    pub fn list_providers(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.providers.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }
}
