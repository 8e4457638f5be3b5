//! Realm lifecycle – from "config loaded" to "connected to a realm".
//!
//! ```text
//! config ready ─▶ Establishing ─▶ resolve realm ─▶ identity ready
//!                                                     │
//!              Established(realm) ◀── change_realm ◀── commit (cache + listeners)
//! ```
//!
//! Realm priority, resolved once per session:
//!
//! | Tier | Source                     | Condition                                  |
//! |------|----------------------------|--------------------------------------------|
//! | 1    | `?realm=` query parameter  | names a live candidate; `v2` must ping OK  |
//! | 2    | cached last realm          | taken as-is, no candidate scan             |
//! | 3    | selection algorithm        | over the full candidate list               |
//!
//! If no tier yields a realm the session fails with a connection error.
//! Failures park the phase in [`CommsPhase::Failed`]; nothing retries
//! automatically.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

use crate::cache::RealmCache;
use crate::candidates::{filter_by_min_version, CandidateSource};
use crate::config::CommsConfig;
use crate::connection::WorldInstanceConnection;
use crate::error::{CommsError, Result};
use crate::events::{ListenerId, Listeners};
use crate::selection::{find_candidate_by_name, requires_ping, RealmPinger, SelectionAlgorithm};
use crate::types::{Candidate, Parcel, Realm};

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalErrorKind {
    Connection,
    RealmFull,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalError {
    pub kind: FatalErrorKind,
    pub message: String,
}

impl From<&CommsError> for FatalError {
    fn from(e: &CommsError) -> Self {
        let kind = match e {
            CommsError::RealmFull(_) => FatalErrorKind::RealmFull,
            CommsError::Connection(_) | CommsError::Timeout(_) => FatalErrorKind::Connection,
            _ => FatalErrorKind::Other,
        };
        Self {
            kind,
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CommsPhase {
    #[default]
    Idle,
    Establishing,
    Established(Realm),
    Failed(FatalError),
}

// ---------------------------------------------------------------------------
// Gates
// ---------------------------------------------------------------------------

/// Readiness flags the saga waits on, plus the observable phase.
pub struct Gates {
    config_ready: watch::Sender<bool>,
    identity_ready: watch::Sender<bool>,
    phase: watch::Sender<CommsPhase>,
}

impl Default for Gates {
    fn default() -> Self {
        Self::new()
    }
}

impl Gates {
    pub fn new() -> Self {
        Self {
            config_ready: watch::channel(false).0,
            identity_ready: watch::channel(false).0,
            phase: watch::channel(CommsPhase::Idle).0,
        }
    }

    /// Gates that are already open.
    pub fn ready() -> Self {
        let gates = Self::new();
        gates.mark_config_ready();
        gates.mark_identity_ready();
        gates
    }

    pub fn mark_config_ready(&self) {
        self.config_ready.send_replace(true);
    }

    pub fn mark_identity_ready(&self) {
        self.identity_ready.send_replace(true);
    }

    pub fn phase(&self) -> CommsPhase {
        self.phase.borrow().clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<CommsPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: CommsPhase) {
        debug!("comms phase → {:?}", phase);
        self.phase.send_replace(phase);
    }

    async fn wait_config_ready(&self) {
        // The sender lives in `self`, so the wait cannot fail.
        let _ = self.config_ready.subscribe().wait_for(|ready| *ready).await;
    }

    async fn wait_identity_ready(&self) {
        let _ = self.identity_ready.subscribe().wait_for(|ready| *ready).await;
    }
}

// ---------------------------------------------------------------------------
// Saga
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    /// `?realm=` as typed by the user.
    pub realm_param: Option<String>,
    /// Where the user spawns; feeds the selection algorithm.
    pub origin: Parcel,
}

pub struct RealmSaga {
    config: CommsConfig,
    selection: SelectionAlgorithm,
    source: Arc<dyn CandidateSource>,
    cache: Arc<dyn RealmCache>,
    pinger: Arc<dyn RealmPinger>,
    connection: Arc<WorldInstanceConnection>,
    gates: Arc<Gates>,
    candidates: Mutex<Option<Vec<Candidate>>>,
    realm: Mutex<Option<Realm>>,
    realm_listeners: Listeners<Realm>,
}

impl RealmSaga {
    pub fn new(
        config: CommsConfig,
        source: Arc<dyn CandidateSource>,
        cache: Arc<dyn RealmCache>,
        pinger: Arc<dyn RealmPinger>,
        connection: Arc<WorldInstanceConnection>,
        gates: Arc<Gates>,
    ) -> Self {
        let selection = config.selection();
        Self {
            config,
            selection,
            source,
            cache,
            pinger,
            connection,
            gates,
            candidates: Mutex::new(None),
            realm: Mutex::new(None),
            realm_listeners: Listeners::new(),
        }
    }

    pub fn gates(&self) -> &Arc<Gates> {
        &self.gates
    }

    pub fn connection(&self) -> &Arc<WorldInstanceConnection> {
        &self.connection
    }

    pub fn current_realm(&self) -> Option<Realm> {
        self.realm.lock().clone()
    }

    pub fn candidates(&self) -> Vec<Candidate> {
        self.candidates.lock().clone().unwrap_or_default()
    }

    pub fn on_realm<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&Realm) + Send + Sync + 'static,
    {
        self.realm_listeners.subscribe(callback)
    }

    pub fn remove_realm_listener(&self, id: ListenerId) -> bool {
        self.realm_listeners.unsubscribe(id)
    }

    // -----------------------------------------------------------------------
    // Session start
    // -----------------------------------------------------------------------

    pub async fn start(&self, request: SessionRequest) -> Result<Realm> {
        self.gates.wait_config_ready().await;
        self.gates.set_phase(CommsPhase::Establishing);

        self.load_cached_candidates();
        let realm = match self.resolve_realm(&request).await {
            Ok(realm) => realm,
            Err(e) => return Err(self.fail(e)),
        };

        self.gates.wait_identity_ready().await;
        self.connect_to(realm).await
    }

    /// Explicit realm switch requested by the user.
    pub async fn change_realm_by_name(&self, name: &str) -> Result<Realm> {
        let candidates = self.ensure_candidates().await;
        let candidate = find_candidate_by_name(&candidates, name)
            .ok_or_else(|| CommsError::Connection(format!("unknown realm '{}'", name)))?;
        if candidate.is_full() {
            return Err(CommsError::RealmFull(candidate.realm.server_name.clone()));
        }
        let realm = candidate.realm.clone();

        self.gates.set_phase(CommsPhase::Establishing);
        self.connect_to(realm).await
    }

    async fn connect_to(&self, realm: Realm) -> Result<Realm> {
        self.commit(&realm);
        match self.connection.change_realm(realm.clone()).await {
            Ok(()) => {
                self.gates.set_phase(CommsPhase::Established(realm.clone()));
                Ok(realm)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&self, e: CommsError) -> CommsError {
        if matches!(e, CommsError::Superseded) {
            debug!("Realm change superseded; leaving phase to the newer change");
        } else {
            warn!("Comms failed: {}", e);
            self.gates.set_phase(CommsPhase::Failed(FatalError::from(&e)));
        }
        e
    }

    /// Persist (best-effort), record and announce the realm.
    fn commit(&self, realm: &Realm) {
        if let Err(e) = self.cache.save_realm(&self.config.network_id, realm) {
            warn!("Failed to cache realm {}: {}", realm, e);
        }
        *self.realm.lock() = Some(realm.clone());
        info!("Realm set to {}", realm);
        self.realm_listeners.notify(realm);
    }

    // -----------------------------------------------------------------------
    // Realm resolution
    // -----------------------------------------------------------------------

    pub async fn resolve_realm(&self, request: &SessionRequest) -> Result<Realm> {
        if let Some(name) = request.realm_param.as_deref().filter(|n| !n.trim().is_empty()) {
            let candidates = self.ensure_candidates().await;
            match find_candidate_by_name(&candidates, name) {
                Some(candidate) => {
                    let realm = &candidate.realm;
                    if !requires_ping(realm) || self.pinger.ping(realm).await {
                        info!("Using realm '{}' from query parameter", name);
                        return Ok(realm.clone());
                    }
                    warn!("Realm '{}' from query parameter did not answer ping", name);
                }
                None => warn!("Realm '{}' from query parameter is not a known candidate", name),
            }
        }

        match self.cache.load_realm(&self.config.network_id) {
            Ok(Some(realm)) => {
                info!("Using cached realm {}", realm);
                return Ok(realm);
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable realm cache: {}", e),
        }

        let candidates = self.ensure_candidates().await;
        self.selection
            .select(&candidates, request.origin)
            .map(|c| c.realm)
            .ok_or_else(|| CommsError::Connection("no realm available".into()))
    }

    // -----------------------------------------------------------------------
    // Candidates
    // -----------------------------------------------------------------------

    fn load_cached_candidates(&self) {
        if self.candidates.lock().is_some() {
            return;
        }
        match self.cache.load_candidates(&self.config.network_id) {
            Ok(Some(cached)) if !cached.is_empty() => {
                debug!("Loaded {} cached candidates", cached.len());
                *self.candidates.lock() = Some(cached);
            }
            Ok(_) => {}
            Err(e) => warn!("Ignoring unreadable candidate cache: {}", e),
        }
    }

    /// In-memory candidates, fetching them on first use.
    async fn ensure_candidates(&self) -> Vec<Candidate> {
        let cached = self.candidates.lock().clone();
        if let Some(candidates) = cached.filter(|c| !c.is_empty()) {
            return candidates;
        }
        match self.fetch_filtered(None).await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!("Candidate fetch failed, continuing without: {}", e);
                self.candidates()
            }
        }
    }

    /// Re-measure known hosts (or scan if none are known).
    ///
    /// On failure the previous list stays in place.
    pub async fn refresh_candidates(&self) -> Result<usize> {
        let hosts: Vec<String> = self
            .candidates()
            .iter()
            .map(|c| c.realm.hostname.clone())
            .collect();
        let hosts = (!hosts.is_empty()).then_some(hosts);
        match self.fetch_filtered(hosts).await {
            Ok(fresh) => Ok(fresh.len()),
            Err(e) => {
                warn!("Candidate refresh failed, keeping stale list: {}", e);
                Err(e)
            }
        }
    }

    async fn fetch_filtered(&self, hosts: Option<Vec<String>>) -> Result<Vec<Candidate>> {
        let fetched = match hosts {
            Some(hosts) => self.source.fetch_statuses(&hosts).await?,
            None => {
                self.source
                    .fetch_candidates(&self.config.candidates_endpoint)
                    .await?
            }
        };
        let filtered = filter_by_min_version(
            fetched,
            &self.config.min_catalyst_version,
            &self.config.pinned_hosts,
        );
        if filtered.is_empty() {
            return Err(CommsError::Network("no usable candidates".into()));
        }

        debug!("Candidate list replaced ({} entries)", filtered.len());
        *self.candidates.lock() = Some(filtered.clone());
        if let Err(e) = self
            .cache
            .save_candidates(&self.config.network_id, &filtered)
        {
            warn!("Failed to cache candidates: {}", e);
        }
        Ok(filtered)
    }
}
