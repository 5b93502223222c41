//! `Daemon` (spec.md §4.8, C10): the top-level registry binding every
//! other component together and exposing the verb surface from spec.md
//! §6 as plain async methods, ready to be mounted behind whatever
//! transport a caller chooses.

use crate::config::DaemonConfig;
use sso_acm::AccessControlManager;
use sso_db::{IdentityFilter, Store};
use sso_dictionary::{IdentityInfo, SecurityContext, SsoError, SsoResult};
use sso_identity::Identity;
use sso_plugin::PluginFactory;
use sso_storage::StorageManager;
use sso_ui::UiBroker;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Tracks live `Identity` objects under a daemon-issued handle rather
/// than the identity's own database id, since every unstored ("new")
/// identity reports `id() == 0` and several may be registered by
/// different callers at once (spec.md §4.2: "new when its id is 0").
pub struct Daemon {
    config: DaemonConfig,
    store: Arc<Store>,
    storage_manager: Arc<dyn StorageManager>,
    acm: Arc<dyn AccessControlManager>,
    plugins: Arc<PluginFactory>,
    ui: Arc<UiBroker>,
    identities: Mutex<HashMap<u64, Arc<Identity>>>,
    next_handle: AtomicU64,
    identity_timeout: Duration,
    auth_session_timeout: Duration,
    daemon_timeout: Duration,
    last_activity: StdMutex<Instant>,
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        store: Arc<Store>,
        storage_manager: Arc<dyn StorageManager>,
        acm: Arc<dyn AccessControlManager>,
        ui: Arc<UiBroker>,
    ) -> Arc<Self> {
        let plugins = PluginFactory::new(config.general.plugins_dir.clone(), config.general.plugin_timeout);
        let identity_timeout = config.object_timeouts.identity_timeout;
        let auth_session_timeout = config.object_timeouts.auth_session_timeout;
        let daemon_timeout = config.object_timeouts.daemon_timeout;
        Arc::new(Self {
            config,
            store,
            storage_manager,
            acm,
            plugins,
            ui,
            identities: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            identity_timeout,
            auth_session_timeout,
            daemon_timeout,
            last_activity: StdMutex::new(Instant::now()),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn acm(&self) -> &Arc<dyn AccessControlManager> {
        &self.acm
    }

    pub fn storage_manager(&self) -> &Arc<dyn StorageManager> {
        &self.storage_manager
    }

    pub fn plugins(&self) -> &Arc<PluginFactory> {
        &self.plugins
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// True once no identity is registered and the daemon has been idle
    /// past `ObjectTimeouts/DaemonTimeout`, mirroring the D-Bus
    /// activation auto-quit behavior of an on-demand-started daemon
    /// (spec.md §6's `ObjectTimeouts/DaemonTimeout` entry).
    pub async fn is_idle_past_timeout(&self) -> bool {
        if !self.identities.lock().await.is_empty() {
            return false;
        }
        self.last_activity.lock().unwrap().elapsed() >= self.daemon_timeout
    }

    async fn insert(&self, identity: Arc<Identity>) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.identities.lock().await.insert(handle, identity);
        handle
    }

    /// Registers a brand-new, unstored identity owned by `peer`.
    pub async fn register_new_identity(&self, peer: &SecurityContext) -> u64 {
        self.touch();
        let identity = Identity::register_new(
            peer.clone(),
            self.store.clone(),
            self.acm.clone(),
            self.plugins.clone(),
            self.ui.clone(),
            self.identity_timeout,
            self.auth_session_timeout,
        );
        self.insert(identity).await
    }

    /// Loads a previously-stored identity, validating that `peer` has
    /// use access before handing back a handle.
    pub async fn get_identity(&self, id: u32, peer: &SecurityContext) -> SsoResult<u64> {
        self.touch();
        let identity = Identity::load(
            id,
            self.store.clone(),
            self.acm.clone(),
            self.plugins.clone(),
            self.ui.clone(),
            self.identity_timeout,
            self.auth_session_timeout,
        )
        .await?;
        identity.get_info(peer).await?;
        Ok(self.insert(identity).await)
    }

    /// Looks up a previously registered handle.
    pub async fn identity(&self, handle: u64) -> SsoResult<Arc<Identity>> {
        self.identities
            .lock()
            .await
            .get(&handle)
            .cloned()
            .ok_or(SsoError::IdentityNotFound)
    }

    pub fn query_methods(&self) -> Vec<String> {
        self.plugins.query_methods()
    }

    pub async fn query_mechanisms(&self, method: &str) -> SsoResult<Vec<String>> {
        self.plugins.query_mechanisms(method).await
    }

    /// Administrative identity search, restricted to the keychain
    /// context (spec.md §6: query/clear are keychain-only operations).
    pub async fn query_identities(
        &self,
        peer: &SecurityContext,
        filter: IdentityFilter,
    ) -> SsoResult<Vec<IdentityInfo>> {
        if peer != self.acm.keychain_context() {
            return Err(SsoError::PermissionDenied);
        }
        self.store.metadata.query_identities(filter).await
    }

    /// Wipes both stores and the in-memory identity registry. Keychain
    /// only, matching `query_identities`'s access gate.
    pub async fn clear(&self, peer: &SecurityContext) -> SsoResult<()> {
        if peer != self.acm.keychain_context() {
            return Err(SsoError::PermissionDenied);
        }
        self.store.metadata.clear().await?;
        self.store.secret.clear().await?;
        self.identities.lock().await.clear();
        Ok(())
    }

    /// Disposes idle sessions and identities (spec.md §4.2/§4.3's
    /// disposal rules), intended to run on a periodic tick from
    /// `main.rs`. Sessions are swept first since an identity with any
    /// live session is never disposable.
    pub async fn sweep(&self) {
        let snapshot: Vec<(u64, Arc<Identity>)> =
            self.identities.lock().await.iter().map(|(h, i)| (*h, i.clone())).collect();

        for (handle, identity) in &snapshot {
            for session in identity.sessions_snapshot().await {
                if session.is_disposable() {
                    session.dispose().await;
                    identity.forget_session(session.id()).await;
                    tracing::debug!(handle, session_id = session.id(), "disposed idle session");
                }
            }
        }

        let mut identities = self.identities.lock().await;
        let mut disposed = Vec::new();
        for (handle, identity) in identities.iter() {
            if identity.is_disposable() {
                disposed.push(*handle);
            }
        }
        for handle in disposed {
            identities.remove(&handle);
            tracing::debug!(handle, "disposed idle identity");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sso_acm::DefaultAcm;
    use sso_dictionary::WILDCARD;
    use sso_ui::NullUiAgent;
    use std::time::Duration;

    fn ctx(s: &str) -> SecurityContext {
        SecurityContext::new(s, WILDCARD)
    }

    async fn test_daemon() -> Arc<Daemon> {
        let store = Arc::new(Store::new(":memory:", ":memory:"));
        store.open().await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let storage_manager: Arc<dyn StorageManager> =
            Arc::new(sso_storage::DefaultStorageManager::new(tmp.path(), "test"));
        let acm: Arc<dyn AccessControlManager> = Arc::new(DefaultAcm::always_admit(ctx("keychain")));
        let ui = UiBroker::new(Arc::new(NullUiAgent::new()));

        let mut config = DaemonConfig::default();
        config.general.plugins_dir = tmp.path().to_path_buf();
        config.object_timeouts.identity_timeout = Duration::from_millis(10);
        config.object_timeouts.auth_session_timeout = Duration::from_millis(10);

        Daemon::new(config, store, storage_manager, acm, ui)
    }

    #[tokio::test]
    async fn register_and_lookup_new_identity() {
        let daemon = test_daemon().await;
        let peer = ctx("app1");
        let handle = daemon.register_new_identity(&peer).await;
        let identity = daemon.identity(handle).await.unwrap();
        assert_eq!(identity.id(), 0);
    }

    #[tokio::test]
    async fn lookup_of_unknown_handle_fails() {
        let daemon = test_daemon().await;
        let err = daemon.identity(9999).await.unwrap_err();
        assert_eq!(err, SsoError::IdentityNotFound);
    }

    #[tokio::test]
    async fn query_identities_denied_for_non_keychain_peer() {
        let daemon = test_daemon().await;
        let err = daemon
            .query_identities(&ctx("app1"), IdentityFilter::default())
            .await
            .unwrap_err();
        assert_eq!(err, SsoError::PermissionDenied);
    }

    #[tokio::test]
    async fn clear_denied_for_non_keychain_peer() {
        let daemon = test_daemon().await;
        let err = daemon.clear(&ctx("app1")).await.unwrap_err();
        assert_eq!(err, SsoError::PermissionDenied);
    }

    #[tokio::test]
    async fn clear_allowed_for_keychain_peer() {
        let daemon = test_daemon().await;
        daemon.register_new_identity(&ctx("app1")).await;
        daemon.clear(&ctx("keychain")).await.unwrap();
        assert!(daemon.query_identities(&ctx("keychain"), IdentityFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_disposes_idle_new_identity() {
        let daemon = test_daemon().await;
        let handle = daemon.register_new_identity(&ctx("app1")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        daemon.sweep().await;
        let err = daemon.identity(handle).await.unwrap_err();
        assert_eq!(err, SsoError::IdentityNotFound);
    }

    #[tokio::test]
    async fn daemon_not_idle_while_identity_registered() {
        let daemon = test_daemon().await;
        daemon.register_new_identity(&ctx("app1")).await;
        assert!(!daemon.is_idle_past_timeout().await);
    }
}
