use crate::event::IdentityEvent;
use crate::secret_sink::SecretSink;
use sso_acm::AccessControlManager;
use sso_db::Store;
use sso_dictionary::{Credential, Dictionary, IdentityInfo, SecurityContext, SsoError, SsoResult, Value};
use sso_plugin::PluginFactory;
use sso_session::AuthSession;
use sso_ui::{BrokerEvent, UiBroker};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio::sync::{broadcast, Mutex};

/// Caller-facing request for [`Identity::store`]. Mirrors
/// [`IdentityInfo`] except `owner`/`acl` are `Option`: `None` means "the
/// caller did not supply this field, preserve the server-side value",
/// the distinction spec.md §4.2's `store` effect column needs but which
/// `IdentityInfo` itself (shared with the wire-agnostic DB layer) has no
/// room to express. See DESIGN.md for this Open-Question resolution.
#[derive(Debug, Clone, Default)]
pub struct StoreRequest {
    pub username: Option<String>,
    pub username_is_secret: bool,
    pub secret: Option<String>,
    pub store_secret: bool,
    pub caption: Option<String>,
    pub realms: Vec<String>,
    pub methods: BTreeMap<String, BTreeSet<String>>,
    pub owner: Option<SecurityContext>,
    pub acl: Option<Vec<SecurityContext>>,
    pub r#type: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    New,
    Stored,
    SignedOut,
    Removed,
}

/// In-memory representation of one identity: orchestrates verify/
/// store/remove/reference/signout and spawns auth sessions (spec.md
/// §4.2, C9). Owned exclusively by the Daemon's live-identity registry.
pub struct Identity {
    id: AtomicU32,
    info: Mutex<IdentityInfo>,
    state: Mutex<IdentityState>,
    store: Arc<Store>,
    acm: Arc<dyn AccessControlManager>,
    plugins: Arc<PluginFactory>,
    ui: Arc<UiBroker>,
    sessions: Mutex<HashMap<String, Arc<AuthSession>>>,
    last_touched: StdMutex<Instant>,
    identity_timeout: Duration,
    auth_session_timeout: Duration,
    events: broadcast::Sender<IdentityEvent>,
}

impl Identity {
    #[allow(clippy::too_many_arguments)]
    fn build(
        info: IdentityInfo,
        state: IdentityState,
        store: Arc<Store>,
        acm: Arc<dyn AccessControlManager>,
        plugins: Arc<PluginFactory>,
        ui: Arc<UiBroker>,
        identity_timeout: Duration,
        auth_session_timeout: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            id: AtomicU32::new(info.id),
            info: Mutex::new(info),
            state: Mutex::new(state),
            store,
            acm,
            plugins,
            ui,
            sessions: Mutex::new(HashMap::new()),
            last_touched: StdMutex::new(Instant::now()),
            identity_timeout,
            auth_session_timeout,
            events,
        })
    }

    /// Registers a brand-new, unstored identity (spec.md §4.2: "new
    /// when its id is 0"). `owner` becomes both the owner and the sole
    /// implicit ACL entry's match target until `store` is called.
    #[allow(clippy::too_many_arguments)]
    pub fn register_new(
        owner: SecurityContext,
        store: Arc<Store>,
        acm: Arc<dyn AccessControlManager>,
        plugins: Arc<PluginFactory>,
        ui: Arc<UiBroker>,
        identity_timeout: Duration,
        auth_session_timeout: Duration,
    ) -> Arc<Self> {
        Self::build(
            IdentityInfo::new(owner),
            IdentityState::New,
            store,
            acm,
            plugins,
            ui,
            identity_timeout,
            auth_session_timeout,
        )
    }

    /// Loads a previously-stored identity from the Metadata DB.
    #[allow(clippy::too_many_arguments)]
    pub async fn load(
        id: u32,
        store: Arc<Store>,
        acm: Arc<dyn AccessControlManager>,
        plugins: Arc<PluginFactory>,
        ui: Arc<UiBroker>,
        identity_timeout: Duration,
        auth_session_timeout: Duration,
    ) -> SsoResult<Arc<Self>> {
        let info = store.metadata.get_identity(id).await?;
        Ok(Self::build(
            info,
            IdentityState::Stored,
            store,
            acm,
            plugins,
            ui,
            identity_timeout,
            auth_session_timeout,
        ))
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> IdentityState {
        *self.state.lock().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IdentityEvent> {
        self.events.subscribe()
    }

    fn touch(&self) {
        *self.last_touched.lock().unwrap() = Instant::now();
    }

    fn ui_caller_id(&self) -> String {
        format!("identity:{}", self.id())
    }

    /// True once there are no live sessions and the identity has been
    /// idle for at least the identity timeout (spec.md §4.2:
    /// "while any session is live, the timer is disabled").
    pub fn is_disposable(&self) -> bool {
        let Ok(sessions) = self.sessions.try_lock() else {
            return false;
        };
        sessions.is_empty() && self.last_touched.lock().unwrap().elapsed() >= self.identity_timeout
    }

    pub async fn is_removed(&self) -> bool {
        matches!(*self.state.lock().await, IdentityState::Removed)
    }

    async fn check_use(&self, peer: &SecurityContext) -> SsoResult<()> {
        let info = self.info.lock().await;
        if self.acm.peer_is_allowed_to_use(peer, &info.owner, &info.acl) {
            Ok(())
        } else {
            Err(SsoError::PermissionDenied)
        }
    }

    async fn check_owner(&self, peer: &SecurityContext) -> SsoResult<()> {
        let info = self.info.lock().await;
        if self.acm.peer_is_owner(peer, &info.owner) {
            Ok(())
        } else {
            Err(SsoError::PermissionDenied)
        }
    }

    /// Drives a UI round-trip for `caller` and waits for its terminal
    /// response, discarding interleaved refresh events (this call site
    /// only cares about the final outcome).
    async fn drive_ui(&self, data: Dictionary) -> Dictionary {
        let mut rx = self.ui.query(self.ui_caller_id(), data).await;
        loop {
            match rx.recv().await {
                Some(BrokerEvent::Final(data)) => return data,
                Some(BrokerEvent::Refresh(_)) => continue,
                None => return Dictionary::new(),
            }
        }
    }

    /// Drives UI to collect new username/password, stores them, and
    /// emits `CredentialsUpdated`. Fails with `CredentialsNotAvailable`
    /// if `store_secret` is false (spec.md §4.2).
    pub async fn request_credentials_update(
        &self,
        peer: &SecurityContext,
        prompt: Dictionary,
    ) -> SsoResult<()> {
        self.check_use(peer).await?;
        if !self.info.lock().await.store_secret {
            return Err(SsoError::CredentialsNotAvailable);
        }
        self.touch();

        let response = self.drive_ui(prompt).await;
        let username = response
            .get_string("username")
            .ok_or_else(|| SsoError::MissingData("username".into()))?
            .to_string();
        let password = response
            .get_string("password")
            .ok_or_else(|| SsoError::MissingData("password".into()))?
            .to_string();

        self.store
            .secret
            .update_credentials(Credential {
                identity_id: self.id(),
                username: username.clone(),
                password,
            })
            .await?;
        self.info.lock().await.username = Some(username);

        let _ = self.events.send(IdentityEvent::CredentialsUpdated {
            identity_id: self.id(),
        });
        Ok(())
    }

    /// Returns the identity's info with `secret` stripped, and
    /// `username` stripped too if `username_is_secret` is set.
    pub async fn get_info(&self, peer: &SecurityContext) -> SsoResult<IdentityInfo> {
        self.check_use(peer).await?;
        Ok(self.info.lock().await.stripped())
    }

    /// Creates and registers an Auth Session bound to this identity and
    /// `method`. A new (unstored) identity permits every method.
    pub async fn get_auth_session(
        self: &Arc<Self>,
        peer: &SecurityContext,
        method: &str,
    ) -> SsoResult<Arc<AuthSession>> {
        self.check_use(peer).await?;

        if !self.plugins.query_methods().iter().any(|m| m == method) {
            return Err(SsoError::MethodNotKnown(method.to_string()));
        }
        {
            let info = self.info.lock().await;
            if !info.is_new() && !info.methods.contains_key(method) {
                return Err(SsoError::MethodNotAvailable(method.to_string()));
            }
        }
        self.touch();

        let proxy = self.plugins.acquire(method).await?;
        let base_params = self.build_base_params(method).await?;
        let sink = Arc::new(SecretSink::new(self.store.clone(), self.id(), method));

        let session_id = uuid::Uuid::new_v4().to_string();
        let session = AuthSession::new(
            session_id.clone(),
            self.id(),
            method,
            self.plugins.clone(),
            proxy,
            self.ui.clone(),
            Some(sink),
            base_params,
            self.auth_session_timeout,
        );
        self.sessions.lock().await.insert(session_id, session.clone());
        Ok(session)
    }

    /// Assembles the context every session needs before its first
    /// `process` call: stored credentials, realms, and any cached
    /// session data from a previous run of this method (spec.md §4.3).
    async fn build_base_params(&self, method: &str) -> SsoResult<Dictionary> {
        let mut params = Dictionary::new();

        let realms = self.info.lock().await.realms.clone();
        if !realms.is_empty() {
            params.set_string_array("realms", realms);
        }

        if let Some(cred) = self.store.secret.load_credentials(self.id()).await? {
            params.set_string("username", cred.username);
            params.set_string("secret", cred.password);
        }

        if let Some(method_id) = self.store.metadata.get_method_id(method.to_string()).await? {
            if let Some(blob) = self.store.secret.load_data(self.id(), method_id).await? {
                if let Ok(cached) = Dictionary::decode(&blob) {
                    params.set("session_cache", Value::Dictionary(cached));
                }
            }
        }

        Ok(params)
    }

    /// Removes a live session from the registry once it disposes.
    /// Called by whatever drives session sweeping (the Daemon's
    /// inactivity scan).
    pub async fn forget_session(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
    }

    pub async fn sessions_snapshot(&self) -> Vec<Arc<AuthSession>> {
        self.sessions.lock().await.values().cloned().collect()
    }

    /// Drives UI to reprompt; on success (the UI agent reports
    /// `verified: true`) marks the identity validated and emits
    /// `UserVerified`.
    pub async fn verify_user(&self, peer: &SecurityContext, prompt: Dictionary) -> SsoResult<()> {
        self.check_use(peer).await?;
        self.touch();

        let response = self.drive_ui(prompt).await;
        if response.get_bool("verified") == Some(true) {
            self.info.lock().await.validated = true;
            let _ = self.events.send(IdentityEvent::UserVerified {
                identity_id: self.id(),
            });
            Ok(())
        } else {
            Err(SsoError::UserInteraction("verification rejected".into()))
        }
    }

    /// Compares `secret` against the Secret DB in constant time.
    pub async fn verify_secret(&self, peer: &SecurityContext, secret: &str) -> SsoResult<bool> {
        self.check_use(peer).await?;
        self.touch();

        let stored = self.store.secret.load_credentials(self.id()).await?;
        let matched = match stored {
            Some(cred) => bool::from(cred.password.as_bytes().ct_eq(secret.as_bytes())),
            None => false,
        };
        if matched {
            self.info.lock().await.validated = true;
            let _ = self.events.send(IdentityEvent::SecretVerified {
                identity_id: self.id(),
            });
        }
        Ok(matched)
    }

    /// Removes the identity from both stores and schedules disposal.
    pub async fn remove(&self, peer: &SecurityContext) -> SsoResult<()> {
        self.check_owner(peer).await?;
        if self.info.lock().await.is_new() {
            return Err(SsoError::IdentityNotFound);
        }
        self.touch();

        self.store.remove_identity(self.id()).await?;
        *self.state.lock().await = IdentityState::Removed;

        let _ = self.events.send(IdentityEvent::Removed {
            identity_id: self.id(),
        });
        Ok(())
    }

    /// Tears down all active sessions for this identity and marks it
    /// signed out; persisted state is left untouched (spec.md §9's
    /// Open Question on token invalidation is resolved as a no-op).
    pub async fn sign_out(&self, peer: &SecurityContext) -> SsoResult<()> {
        self.check_use(peer).await?;
        self.touch();

        let sessions: Vec<_> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            let _ = session.cancel().await;
            session.dispose().await;
        }

        *self.state.lock().await = IdentityState::SignedOut;
        let _ = self.events.send(IdentityEvent::SignedOut {
            identity_id: self.id(),
        });
        Ok(())
    }

    /// Persists `req` via the Metadata and Secret stores, assigning an
    /// id if this identity is new. `req.owner`/`req.acl` of `None`
    /// preserve the server-side values already on file.
    pub async fn store(&self, peer: &SecurityContext, req: StoreRequest) -> SsoResult<u32> {
        self.check_owner(peer).await?;

        let mut info = self.info.lock().await.clone();

        let acl = req.acl.clone().unwrap_or_else(|| info.acl.clone());
        if !self.acm.acl_is_valid(peer, &acl) {
            return Err(SsoError::PermissionDenied);
        }

        info.owner = req.owner.unwrap_or(info.owner);
        info.acl = acl;
        info.username = req.username.or(info.username);
        info.username_is_secret = req.username_is_secret;
        info.secret = req.secret;
        info.store_secret = req.store_secret;
        info.caption = req.caption.or(info.caption);
        if !req.realms.is_empty() {
            info.realms = req.realms;
        }
        if !req.methods.is_empty() {
            info.methods = req.methods;
        }
        info.r#type = req.r#type;

        let id = self.store.store_identity(&info).await?;
        info.id = id;
        info.secret = None;

        self.id.store(id, Ordering::SeqCst);
        *self.info.lock().await = info;
        *self.state.lock().await = IdentityState::Stored;

        let _ = self.events.send(IdentityEvent::DataUpdated { identity_id: id });
        Ok(id)
    }

    /// Adjusts the reference set for the peer's own context. Names are
    /// idempotent per spec.md §3; removing the last reference does not
    /// by itself delete the identity.
    pub async fn add_reference(&self, peer: &SecurityContext, name: String) -> SsoResult<()> {
        self.check_use(peer).await?;
        if self.info.lock().await.is_new() {
            return Err(SsoError::IdentityNotFound);
        }
        self.touch();
        self.store
            .metadata
            .insert_reference(self.id(), peer.clone(), name)
            .await
    }

    pub async fn remove_reference(&self, peer: &SecurityContext, name: String) -> SsoResult<()> {
        self.check_use(peer).await?;
        self.touch();
        self.store
            .metadata
            .remove_reference(self.id(), peer.clone(), name)
            .await
    }
}
