use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::limits::MAX_PROVIDERS;
use crate::model::*;
use crate::notify::{Notice, NotifyHub};

use super::conflict::now_ms;
use super::{
    apply_to_provider, wal_append, Engine, EngineError, SharedProviderState, WalCommand,
};

impl Engine {
    pub fn get_provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    pub fn provider_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_provider.get(entity_id).map(|e| *e.value())
    }

    /// Resolve the provider owning an appointment or availability entry.
    pub(super) fn provider_of(&self, entity_id: &Ulid) -> Result<Ulid, EngineError> {
        self.provider_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))
    }

    /// Provider state for `id`, created empty on first use. Only declarations
    /// create providers; every other mutation needs one to exist.
    pub(super) fn provider_slot(&self, id: Ulid) -> Result<SharedProviderState, EngineError> {
        if let Some(existing) = self.get_provider(&id) {
            return Ok(existing);
        }
        if self.providers.len() >= MAX_PROVIDERS {
            return Err(EngineError::LimitExceeded("too many providers"));
        }
        let slot = self
            .providers
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(ProviderState::new(id))))
            .value()
            .clone();
        metrics::gauge!(crate::observability::PROVIDERS_ACTIVE).set(self.providers.len() as f64);
        Ok(slot)
    }

    /// Take the commit gate and the provider's write lock, both within the
    /// configured lock timeout.
    async fn lock_provider(
        &self,
        provider_id: Ulid,
    ) -> Result<(CommitPermit, OwnedRwLockWriteGuard<ProviderState>), EngineError> {
        let slot = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let gate = self.commit_gate.clone();
        let acquire = async move {
            let permit = gate.read_owned().await;
            let guard = slot.write_owned().await;
            (permit, guard)
        };

        let wait_start = Instant::now();
        let locks = match self.lock_timeout {
            None => acquire.await,
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(locks) => locks,
                Err(_) => {
                    metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                    warn!("provider {provider_id} lock not acquired within {limit:?}");
                    return Err(EngineError::Busy(provider_id));
                }
            },
        };
        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
            .record(wait_start.elapsed().as_secs_f64());
        Ok(locks)
    }

    /// Run one check-then-commit step under the provider's exclusive lock.
    ///
    /// `decide` sees the current state and the commit time, and returns the
    /// event to record or the reason to refuse. The event is journaled and
    /// applied while the lock is held. The resulting notice is published only
    /// after the lock is released. A refusal or a journal failure leaves the
    /// state untouched and publishes nothing.
    ///
    /// The provider must already exist; see [`Engine::provider_slot`].
    ///
    /// Once `decide` has accepted, the commit runs on its own task and
    /// finishes even if the caller stops waiting for it.
    pub(super) async fn with_provider_lock<F>(
        &self,
        provider_id: Ulid,
        decide: F,
    ) -> Result<Notice, EngineError>
    where
        F: FnOnce(&ProviderState, Ms) -> Result<Event, EngineError> + Send,
    {
        let (permit, guard) = self.lock_provider(provider_id).await?;
        let event = decide(&*guard, now_ms())?;

        let commit = Commit {
            wal_tx: self.wal_tx.clone(),
            entity_to_provider: self.entity_to_provider.clone(),
            client_index: self.client_index.clone(),
            notify: self.notify.clone(),
        };
        tokio::spawn(commit.run(permit, guard, event))
            .await
            .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
    }
}

type CommitPermit = OwnedRwLockReadGuard<()>;

/// Everything a commit needs once it no longer borrows the engine.
struct Commit {
    wal_tx: mpsc::Sender<WalCommand>,
    entity_to_provider: Arc<DashMap<Ulid, Ulid>>,
    client_index: Arc<DashMap<Ulid, Vec<Ulid>>>,
    notify: Arc<NotifyHub>,
}

impl Commit {
    async fn run(
        self,
        permit: CommitPermit,
        mut guard: OwnedRwLockWriteGuard<ProviderState>,
        event: Event,
    ) -> Result<Notice, EngineError> {
        let provider_id = guard.id;
        wal_append(&self.wal_tx, &event).await?;
        let notice = apply_to_provider(
            &mut guard,
            &event,
            &self.entity_to_provider,
            &self.client_index,
        );
        drop(guard);
        drop(permit);

        let notice = notice.ok_or(EngineError::WalError(format!(
            "committed event for provider {provider_id} did not apply"
        )))?;
        self.notify.publish(&notice);
        Ok(notice)
    }
}
