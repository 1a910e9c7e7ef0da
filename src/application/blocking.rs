use crate::domain::models::{BlockingStatus, Profile, RestrictedSet, is_placeholder_bundle};
use crate::infrastructure::api_client::{BlockingApiClient, ToggleAction};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::session_store::{SessionKey, SessionStore};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Where the controller sits in the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Starting,
    Active,
    StoppingByServer,
}

/// Boundary to whatever actually enforces a restriction set. The in-memory
/// implementation records the active set for tests and headless runs.
pub trait EnforcementSink: Send + Sync {
    fn apply(&self, restricted: &RestrictedSet) -> Result<(), InfraError>;
    fn clear(&self) -> Result<(), InfraError>;
}

#[derive(Debug, Default)]
pub struct InMemoryEnforcementSink {
    active: Mutex<Option<RestrictedSet>>,
}

impl InMemoryEnforcementSink {
    pub fn active_set(&self) -> Option<RestrictedSet> {
        self.active.lock().ok().and_then(|guard| guard.clone())
    }
}

impl EnforcementSink for InMemoryEnforcementSink {
    fn apply(&self, restricted: &RestrictedSet) -> Result<(), InfraError> {
        *self
            .active
            .lock()
            .map_err(|error| InfraError::Storage(format!("enforcement lock poisoned: {error}")))? =
            Some(restricted.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), InfraError> {
        *self
            .active
            .lock()
            .map_err(|error| InfraError::Storage(format!("enforcement lock poisoned: {error}")))? =
            None;
        Ok(())
    }
}

/// Hands out monotonically increasing sequence numbers so the completion of
/// an older request can be recognized as stale and discarded instead of
/// clobbering state a newer operation already settled.
#[derive(Debug, Default)]
pub struct RequestSequencer {
    next: AtomicU64,
    latest: AtomicU64,
}

impl RequestSequencer {
    pub fn begin(&self) -> u64 {
        let seq = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.latest.store(seq, Ordering::SeqCst);
        seq
    }

    pub fn is_current(&self, seq: u64) -> bool {
        self.latest.load(Ordering::SeqCst) == seq
    }
}

#[derive(Debug, Clone)]
struct ControllerState {
    phase: SessionPhase,
    profile_id: Option<String>,
    session_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    server_backed: bool,
    last_restricted: RestrictedSet,
    applied: Option<RestrictedSet>,
    allow_exceptions: BTreeSet<String>,
}

impl ControllerState {
    fn idle() -> Self {
        Self {
            phase: SessionPhase::Idle,
            profile_id: None,
            session_id: None,
            started_at: None,
            server_backed: false,
            last_restricted: RestrictedSet::empty(),
            applied: None,
            allow_exceptions: BTreeSet::new(),
        }
    }
}

/// Point-in-time view of the controller for callers and the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingSnapshot {
    pub phase: SessionPhase,
    pub is_blocking: bool,
    pub profile_id: Option<String>,
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub server_backed: bool,
    pub allow_exceptions: BTreeSet<String>,
    pub effective: Option<RestrictedSet>,
}

/// Drives the blocking session state machine. Server-backed sessions are
/// authoritative on the server side: the client may start one, but only a
/// server status report ends it. Local sessions never touch the network and
/// toggle freely.
pub struct BlockingSessionController<C, S, E>
where
    C: BlockingApiClient,
    S: SessionStore,
    E: EnforcementSink,
{
    api_client: Arc<C>,
    session_store: Arc<S>,
    sink: Arc<E>,
    sequencer: RequestSequencer,
    // serializes network operations; sequence numbers are issued before the
    // flight lock is taken so a queued older operation resolves as stale
    flight: tokio::sync::Mutex<()>,
    state: Mutex<ControllerState>,
}

impl<C, S, E> BlockingSessionController<C, S, E>
where
    C: BlockingApiClient,
    S: SessionStore,
    E: EnforcementSink,
{
    pub fn new(api_client: Arc<C>, session_store: Arc<S>, sink: Arc<E>) -> Self {
        Self {
            api_client,
            session_store,
            sink,
            sequencer: RequestSequencer::default(),
            flight: tokio::sync::Mutex::new(()),
            state: Mutex::new(ControllerState::idle()),
        }
    }

    /// Restores a persisted session across a restart. A persisted local
    /// session re-applies its profile's restriction set from the catalog; a
    /// persisted server session arms the controller and waits for the next
    /// status refresh to supply the set.
    pub fn load_persisted(&self, catalog: &[Profile]) -> Result<(), InfraError> {
        let mut state = self.lock_state()?;

        if let Some(raw) = self.session_store.load(SessionKey::AllowExceptions)? {
            state.allow_exceptions = serde_json::from_str(&raw)?;
        }
        if !self.session_store.load_bool(SessionKey::IsBlocking)? {
            return Ok(());
        }

        match self.session_store.load(SessionKey::LocalSessionProfileId)? {
            Some(local_profile_id) => {
                let Some(profile) = catalog
                    .iter()
                    .find(|candidate| candidate.id == local_profile_id)
                else {
                    // the profile is gone, the session cannot be honored
                    self.session_store.save_bool(SessionKey::IsBlocking, false)?;
                    self.session_store
                        .remove(SessionKey::LocalSessionProfileId)?;
                    return Ok(());
                };
                state.phase = SessionPhase::Active;
                state.server_backed = false;
                state.profile_id = Some(profile.id.clone());
                self.transition_set(&mut state, profile.restricted_set())?;
            }
            None => {
                state.phase = SessionPhase::Active;
                state.server_backed = true;
            }
        }
        Ok(())
    }

    /// Starts a server-backed session for the given profile.
    pub async fn start(
        &self,
        access_token: &str,
        profile: &Profile,
    ) -> Result<BlockingSnapshot, InfraError> {
        let seq = self.sequencer.begin();
        let _flight = self.flight.lock().await;

        let previous = {
            let mut state = self.lock_state()?;
            if state.phase == SessionPhase::Active && state.server_backed {
                return Err(InfraError::SessionLocked);
            }
            let previous = state.clone();
            state.phase = SessionPhase::Starting;
            previous
        };

        let status = match self
            .api_client
            .toggle_blocking(access_token, &profile.id, ToggleAction::Start)
            .await
        {
            Ok(status) => status,
            Err(error) => {
                let mut state = self.lock_state()?;
                if self.sequencer.is_current(seq) {
                    // the request never took effect; the last confirmed
                    // state stands, including a still-running local session
                    *state = previous;
                }
                return Err(error);
            }
        };

        if !status.is_blocking {
            // server declined to start; the last confirmed state stands
            let mut state = self.lock_state()?;
            if self.sequencer.is_current(seq) {
                *state = previous;
            }
            return Ok(Self::snapshot_of(&state));
        }

        // the server's set is authoritative; the local copy covers the gap if
        // the follow-up read fails
        let restricted = match self.api_client.restricted_apps(access_token, &profile.id).await {
            Ok(restricted) => restricted,
            Err(_) => profile.restricted_set(),
        };

        let mut state = self.lock_state()?;
        if !self.sequencer.is_current(seq) {
            return Ok(Self::snapshot_of(&state));
        }
        state.phase = SessionPhase::Active;
        state.server_backed = true;
        state.profile_id = status.profile_id.or_else(|| Some(profile.id.clone()));
        state.session_id = status.session_id;
        state.started_at = status.started_at.or_else(|| Some(Utc::now()));
        self.transition_set(&mut state, restricted)?;
        self.session_store.save_bool(SessionKey::IsBlocking, true)?;
        self.session_store
            .remove(SessionKey::LocalSessionProfileId)?;
        Ok(Self::snapshot_of(&state))
    }

    /// Reconciles local state with the server's status report. This is the
    /// only path that ends a server-backed session.
    pub async fn refresh(&self, access_token: &str) -> Result<BlockingSnapshot, InfraError> {
        let seq = self.sequencer.begin();
        let _flight = self.flight.lock().await;

        let status = self.api_client.blocking_status(access_token).await?;

        if !status.is_blocking {
            let mut state = self.lock_state()?;
            if !self.sequencer.is_current(seq) {
                return Ok(Self::snapshot_of(&state));
            }
            if state.phase == SessionPhase::Active && state.server_backed {
                state.phase = SessionPhase::StoppingByServer;
                self.settle_idle(&mut state)?;
            }
            // a local session is not the server's to end
            return Ok(Self::snapshot_of(&state));
        }

        let restricted = match &status.profile_id {
            Some(profile_id) => {
                self.api_client
                    .restricted_apps(access_token, profile_id)
                    .await?
            }
            None => RestrictedSet::empty(),
        };

        let mut state = self.lock_state()?;
        if !self.sequencer.is_current(seq) {
            return Ok(Self::snapshot_of(&state));
        }
        self.adopt_server_status(&mut state, status, restricted)?;
        Ok(Self::snapshot_of(&state))
    }

    /// Toggles a local-only session for a profile. Refused while a
    /// server-backed session is active.
    pub fn toggle_local(&self, profile: &Profile) -> Result<BlockingSnapshot, InfraError> {
        self.sequencer.begin();
        let mut state = self.lock_state()?;

        if state.phase == SessionPhase::Active && state.server_backed {
            return Err(InfraError::SessionLocked);
        }

        if state.phase == SessionPhase::Active {
            self.settle_idle(&mut state)?;
            return Ok(Self::snapshot_of(&state));
        }

        state.phase = SessionPhase::Active;
        state.server_backed = false;
        state.profile_id = Some(profile.id.clone());
        state.session_id = None;
        state.started_at = Some(Utc::now());
        self.transition_set(&mut state, profile.restricted_set())?;
        self.session_store.save_bool(SessionKey::IsBlocking, true)?;
        self.session_store
            .save(SessionKey::LocalSessionProfileId, &profile.id)?;
        Ok(Self::snapshot_of(&state))
    }

    /// Exempts a bundle id from the active enforcement set. Exceptions are
    /// discarded whenever the restriction set itself changes.
    pub fn add_allow_exception(&self, bundle_id: &str) -> Result<bool, InfraError> {
        if is_placeholder_bundle(bundle_id) {
            return Ok(false);
        }
        let mut state = self.lock_state()?;
        if !state.allow_exceptions.insert(bundle_id.trim().to_string()) {
            return Ok(false);
        }
        self.persist_exceptions(&state)?;
        self.reapply(&mut state)?;
        Ok(true)
    }

    pub fn snapshot(&self) -> Result<BlockingSnapshot, InfraError> {
        let state = self.lock_state()?;
        Ok(Self::snapshot_of(&state))
    }

    fn adopt_server_status(
        &self,
        state: &mut ControllerState,
        status: BlockingStatus,
        restricted: RestrictedSet,
    ) -> Result<(), InfraError> {
        state.phase = SessionPhase::Active;
        state.server_backed = true;
        state.profile_id = status.profile_id;
        state.session_id = status.session_id;
        state.started_at = status.started_at;
        self.transition_set(state, restricted)?;
        self.session_store.save_bool(SessionKey::IsBlocking, true)?;
        self.session_store
            .remove(SessionKey::LocalSessionProfileId)?;
        Ok(())
    }

    /// Adopts a new restriction set, resetting exceptions if the set changed,
    /// and pushes the effective set to the sink when it differs from what is
    /// already enforced.
    fn transition_set(
        &self,
        state: &mut ControllerState,
        restricted: RestrictedSet,
    ) -> Result<(), InfraError> {
        if state.last_restricted != restricted && !state.allow_exceptions.is_empty() {
            state.allow_exceptions.clear();
            self.persist_exceptions(state)?;
        }
        state.last_restricted = restricted;
        self.reapply(state)
    }

    fn reapply(&self, state: &mut ControllerState) -> Result<(), InfraError> {
        let effective = state.last_restricted.effective(&state.allow_exceptions);
        if state.applied.as_ref() != Some(&effective) {
            self.sink.apply(&effective)?;
            state.applied = Some(effective);
        }
        Ok(())
    }

    fn settle_idle(&self, state: &mut ControllerState) -> Result<(), InfraError> {
        state.phase = SessionPhase::Idle;
        state.profile_id = None;
        state.session_id = None;
        state.started_at = None;
        state.server_backed = false;
        state.last_restricted = RestrictedSet::empty();
        if state.applied.take().is_some() {
            self.sink.clear()?;
        }
        self.session_store.save_bool(SessionKey::IsBlocking, false)?;
        self.session_store
            .remove(SessionKey::LocalSessionProfileId)?;
        Ok(())
    }

    fn persist_exceptions(&self, state: &ControllerState) -> Result<(), InfraError> {
        self.session_store.save(
            SessionKey::AllowExceptions,
            &serde_json::to_string(&state.allow_exceptions)?,
        )
    }

    fn snapshot_of(state: &ControllerState) -> BlockingSnapshot {
        BlockingSnapshot {
            phase: state.phase,
            is_blocking: state.phase == SessionPhase::Active,
            profile_id: state.profile_id.clone(),
            session_id: state.session_id.clone(),
            started_at: state.started_at,
            server_backed: state.server_backed,
            allow_exceptions: state.allow_exceptions.clone(),
            effective: state.applied.clone(),
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, ControllerState>, InfraError> {
        self.state
            .lock()
            .map_err(|error| InfraError::Storage(format!("controller lock poisoned: {error}")))
    }
}
