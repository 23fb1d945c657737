mod conflict;
mod coordinator;
mod error;
mod ledger;
mod lifecycle;
mod mutations;
mod queries;

pub use conflict::{can_book, Admission, ConflictReason};
pub(crate) use conflict::now_ms;
pub use error::EngineError;
pub use ledger::{merge_overlapping, subtract_windows, Ledger, LedgerInterval, Slots};
pub use lifecycle::{advance, Action};
pub use mutations::Declaration;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notice, NotifyHub};
use crate::wal::Wal;

pub type SharedProviderState = Arc<RwLock<ProviderState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stale bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

/// The scheduling core: provider ledgers and appointments, guarded per provider.
pub struct Engine {
    providers: DashMap<Ulid, SharedProviderState>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Appointment or availability entry id → owning provider.
    entity_to_provider: Arc<DashMap<Ulid, Ulid>>,
    /// Client id → their appointment ids, in booking order.
    client_index: Arc<DashMap<Ulid, Vec<Ulid>>>,
    /// Shared by every commit, taken exclusively by compaction while it snapshots.
    commit_gate: Arc<RwLock<()>>,
    lock_timeout: Option<Duration>,
}

/// Apply a committed event to a provider's state. The caller holds the lock.
///
/// Returns the notice describing the change, or `None` when the event refers
/// to something that no longer exists (possible only when replaying a
/// damaged journal).
fn apply_to_provider(
    ps: &mut ProviderState,
    event: &Event,
    entity_map: &DashMap<Ulid, Ulid>,
    client_index: &DashMap<Ulid, Vec<Ulid>>,
) -> Option<Notice> {
    match event {
        Event::EntryDeclared { entry } => {
            ps.ledger.insert(entry.clone());
            entity_map.insert(entry.id, ps.id);
            Some(Notice::AvailabilityDeclared {
                entry: entry.clone(),
            })
        }
        Event::EntryRevoked { id, .. } => {
            let entry = ps.ledger.remove(id)?;
            entity_map.remove(id);
            Some(Notice::AvailabilityRevoked { entry })
        }
        Event::AppointmentBooked { appointment } => {
            entity_map.insert(appointment.id, ps.id);
            let mut ids = client_index.entry(appointment.client_id).or_default();
            if !ids.contains(&appointment.id) {
                ids.push(appointment.id);
            }
            drop(ids);
            ps.insert_appointment(appointment.clone());
            Some(Notice::Booked {
                appointment: appointment.clone(),
            })
        }
        Event::AppointmentRescheduled { id, window, at, .. } => {
            // Re-insert to keep the start-ordered list sorted.
            let mut appointment = ps.remove_appointment(id)?;
            let previous = appointment.window;
            appointment.window = *window;
            appointment.status = Status::Scheduled;
            appointment.updated_at = *at;
            ps.insert_appointment(appointment.clone());
            Some(Notice::Rescheduled {
                previous,
                appointment,
            })
        }
        Event::StatusChanged { id, status, at, .. } => {
            let appointment = ps.appointment_mut(id)?;
            let previous = appointment.status;
            appointment.status = *status;
            appointment.updated_at = *at;
            Some(Notice::StatusChanged {
                previous,
                appointment: appointment.clone(),
            })
        }
    }
}

impl Engine {
    /// Open the engine over the journal at `wal_path`, replaying whatever it holds.
    /// Spawns the journal writer, so it must be called inside a Tokio runtime.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let entity_to_provider: Arc<DashMap<Ulid, Ulid>> = Arc::new(DashMap::new());
        let client_index: Arc<DashMap<Ulid, Vec<Ulid>>> = Arc::new(DashMap::new());

        // Rebuild plain state first; wrap in locks once nothing else can see it.
        let mut states: HashMap<Ulid, ProviderState> = HashMap::new();
        for event in &events {
            let provider_id = event.provider_id();
            let ps = states
                .entry(provider_id)
                .or_insert_with(|| ProviderState::new(provider_id));
            if apply_to_provider(ps, event, &entity_to_provider, &client_index).is_none() {
                tracing::warn!(
                    "replay: skipped event for unknown entity on provider {provider_id}"
                );
            }
        }

        let providers = DashMap::new();
        for (id, ps) in states {
            providers.insert(id, Arc::new(RwLock::new(ps)));
        }
        if !events.is_empty() {
            info!(
                "replayed {} events for {} providers",
                events.len(),
                providers.len()
            );
        }
        metrics::gauge!(crate::observability::PROVIDERS_ACTIVE).set(providers.len() as f64);

        Ok(Self {
            providers,
            wal_tx,
            notify,
            entity_to_provider,
            client_index,
            commit_gate: Arc::new(RwLock::new(())),
            lock_timeout: None,
        })
    }

    /// Bound how long a mutation waits for its locks before failing with `Busy`.
    /// `None` waits indefinitely.
    pub fn with_lock_timeout(mut self, lock_timeout: Option<Duration>) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }
}

/// Write event to WAL via the background group-commit writer.
async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::WalError(e.to_string()))
}
