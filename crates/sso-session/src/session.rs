use crate::store_sink::MethodDataSink;
use sso_dictionary::{Dictionary, SsoError, SsoResult};
use sso_plugin::{PluginFactory, PluginProxy};
use sso_plugin_protocol::Event;
use sso_ui::UiBroker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};

/// Caller-facing outcome of `process`/`user_action_finished`, the
/// three event kinds spec.md §4.3 names at this boundary: everything
/// else (`response`, `status_changed`, `store`, a `refreshed` UI echo)
/// is consumed internally by the session and never surfaces here.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Final(Dictionary),
    Error(SsoError),
    UserActionRequired(Dictionary),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    AwaitingUi,
    Terminal,
    Disposed,
}

enum EventOutcome {
    Continue,
    Return(SessionOutcome),
}

/// Binds an `(identity, method)` pair to a plugin proxy and drives the
/// request/UI-action/refresh state machine described in spec.md §4.3.
/// Owned exclusively by the Identity that created it.
pub struct AuthSession {
    id: String,
    identity_id: u32,
    method: String,
    factory: Arc<PluginFactory>,
    proxy: Arc<PluginProxy>,
    ui: Arc<UiBroker>,
    store_sink: Option<Arc<dyn MethodDataSink>>,
    /// Credentials/realm/session-cache context the owning Identity
    /// assembles before the session is handed to the application
    /// (spec.md §4.3: "Parameters that must always be available:
    /// method-specific credentials from the Secret DB ..., realm, and
    /// any session cache"). Merged under the caller's `process` params
    /// on every call, caller keys taking precedence on conflict.
    base_params: Dictionary,
    mechanism: Mutex<Option<String>>,
    state: Mutex<SessionState>,
    tag: Mutex<Option<u64>>,
    current_dialog: Mutex<Option<String>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    cancel_signal: Mutex<Option<oneshot::Sender<()>>>,
    has_requested: AtomicBool,
    canceled_once: AtomicBool,
    last_touched: StdMutex<Instant>,
    timeout: Duration,
}

impl AuthSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        identity_id: u32,
        method: impl Into<String>,
        factory: Arc<PluginFactory>,
        proxy: Arc<PluginProxy>,
        ui: Arc<UiBroker>,
        store_sink: Option<Arc<dyn MethodDataSink>>,
        base_params: Dictionary,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            identity_id,
            method: method.into(),
            factory,
            proxy,
            ui,
            store_sink,
            base_params,
            mechanism: Mutex::new(None),
            state: Mutex::new(SessionState::Idle),
            tag: Mutex::new(None),
            current_dialog: Mutex::new(None),
            rx: Mutex::new(None),
            cancel_signal: Mutex::new(None),
            has_requested: AtomicBool::new(false),
            canceled_once: AtomicBool::new(false),
            last_touched: StdMutex::new(Instant::now()),
            timeout,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity_id(&self) -> u32 {
        self.identity_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    fn touch(&self) {
        *self.last_touched.lock().unwrap() = Instant::now();
    }

    /// True once the session has no outstanding plugin request and has
    /// been idle for at least the auth-session timeout (spec.md §4.3,
    /// "Cancellation and timeouts"). The daemon sweeps live sessions
    /// against this to dispose of them.
    pub fn is_disposable(&self) -> bool {
        let Ok(state) = self.state.try_lock() else {
            return false;
        };
        matches!(*state, SessionState::Idle | SessionState::Terminal)
            && self.last_touched.lock().unwrap().elapsed() >= self.timeout
    }

    pub async fn dispose(&self) {
        *self.state.lock().await = SessionState::Disposed;
        self.factory.release(&self.method).await;
    }

    /// Forwards to the plugin's `request_initial` on the first call
    /// for this session, `request` on subsequent calls, per spec.md
    /// §4.3. Valid only from `Idle`.
    pub async fn process(
        self: &Arc<Self>,
        mechanism: impl Into<String>,
        params: Dictionary,
    ) -> SsoResult<SessionOutcome> {
        {
            let mut state = self.state.lock().await;
            if !matches!(*state, SessionState::Idle) {
                return Err(SsoError::Unknown(
                    "process called while session is not idle".into(),
                ));
            }
            *state = SessionState::Active;
        }
        self.touch();

        let mechanism = mechanism.into();
        *self.mechanism.lock().await = Some(mechanism.clone());

        let mut merged = self.base_params.clone();
        for (key, value) in params.iter() {
            merged.set(key.clone(), value.clone());
        }
        let params = merged;

        let first_call = !self.has_requested.swap(true, Ordering::SeqCst);
        let (tag, rx) = if first_call {
            self.proxy.request_initial(&mechanism, params).await?
        } else {
            self.proxy.request(&mechanism, params).await?
        };
        *self.tag.lock().await = Some(tag);
        *self.rx.lock().await = Some(rx);

        self.await_event().await
    }

    /// Resumes a session parked in `AwaitingUi`: resolves the UI
    /// broker's active slot for this session and forwards `data` to
    /// the plugin as `user_action_finished`.
    pub async fn user_action_finished(
        self: &Arc<Self>,
        data: Dictionary,
    ) -> SsoResult<SessionOutcome> {
        {
            let state = self.state.lock().await;
            if !matches!(*state, SessionState::AwaitingUi) {
                return Err(SsoError::Unknown(
                    "user_action_finished called while not awaiting a ui action".into(),
                ));
            }
        }
        self.touch();

        if self.current_dialog.lock().await.take().is_some() {
            self.ui.deliver_final(data.clone()).await;
        }

        let tag = self
            .tag
            .lock()
            .await
            .ok_or_else(|| SsoError::Unknown("no outstanding plugin request".into()))?;
        self.proxy.user_action_finished(tag, data).await?;
        *self.state.lock().await = SessionState::Active;

        self.await_event().await
    }

    /// Forwards a mid-dialog refresh to the plugin, keyed by the
    /// dialog id recorded at the last `user_action_required`
    /// (spec.md §4.4: refresh is routed by dialog id, not tag).
    pub async fn refresh(&self, data: Dictionary) -> SsoResult<()> {
        let dialog = self
            .current_dialog
            .lock()
            .await
            .clone()
            .ok_or_else(|| SsoError::MissingData("no active ui dialog to refresh".into()))?;
        self.touch();
        self.proxy.refresh(&dialog, data).await
    }

    /// Idempotent at any state (spec.md §5). The first call resolves
    /// the outstanding request with `error(SessionCanceled)` — returned
    /// here as `Err` so the caller observes exactly one terminal event
    /// — and returns the session to `Idle`. Later calls are no-ops.
    pub async fn cancel(self: &Arc<Self>) -> SsoResult<()> {
        {
            let state = self.state.lock().await;
            if matches!(*state, SessionState::Terminal | SessionState::Disposed) {
                return Ok(());
            }
        }

        let already_canceled = self.canceled_once.swap(true, Ordering::SeqCst);

        if let Some(tag) = *self.tag.lock().await {
            self.proxy.cancel(tag).await;
        }
        if let Some(tx) = self.cancel_signal.lock().await.take() {
            let _ = tx.send(());
        }
        if self.current_dialog.lock().await.take().is_some() {
            self.ui.cancel(&self.id).await;
        }

        *self.state.lock().await = SessionState::Idle;
        self.touch();

        if already_canceled {
            Ok(())
        } else {
            Err(SsoError::SessionCanceled)
        }
    }

    /// Waits for the next event addressed to this session's
    /// outstanding tag, looping past events that don't surface to the
    /// caller (`response`, `status_changed`, `store`, `refreshed`),
    /// racing against a concurrent `cancel`.
    async fn await_event(self: &Arc<Self>) -> SsoResult<SessionOutcome> {
        loop {
            let (cancel_tx, mut cancel_rx) = oneshot::channel();
            *self.cancel_signal.lock().await = Some(cancel_tx);

            let received = {
                let mut rx_guard = self.rx.lock().await;
                let Some(rx) = rx_guard.as_mut() else {
                    return Err(SsoError::Unknown("no outstanding plugin request".into()));
                };
                tokio::select! {
                    biased;
                    _ = &mut cancel_rx => None,
                    event = rx.recv() => Some(event),
                }
            };
            self.cancel_signal.lock().await.take();

            match received {
                None => return Ok(SessionOutcome::Error(SsoError::SessionCanceled)),
                Some(None) => {
                    *self.state.lock().await = SessionState::Terminal;
                    return Ok(SessionOutcome::Error(SsoError::PluginDied));
                }
                Some(Some(event)) => match self.apply_event(event).await {
                    EventOutcome::Continue => continue,
                    EventOutcome::Return(outcome) => return Ok(outcome),
                },
            }
        }
    }

    async fn apply_event(self: &Arc<Self>, event: Event) -> EventOutcome {
        match event {
            Event::ResponseFinal { data, .. } => {
                *self.state.lock().await = SessionState::Terminal;
                EventOutcome::Return(SessionOutcome::Final(data))
            }
            Event::Error { kind, message, .. } => {
                *self.state.lock().await = SessionState::Terminal;
                EventOutcome::Return(SessionOutcome::Error(classify_error(&kind, message)))
            }
            Event::UserActionRequired {
                dialog_id, data, ..
            } => {
                *self.current_dialog.lock().await = Some(dialog_id.clone());
                *self.state.lock().await = SessionState::AwaitingUi;
                let _ = self.ui.query(self.id.clone(), data.clone()).await;
                EventOutcome::Return(SessionOutcome::UserActionRequired(data))
            }
            Event::Store { data, .. } => {
                if let Some(sink) = &self.store_sink {
                    sink.store(data).await;
                }
                EventOutcome::Continue
            }
            Event::Refreshed { data, .. } => {
                let _ = self.ui.refresh(&self.id, data).await;
                EventOutcome::Continue
            }
            Event::Response { .. } | Event::StatusChanged { .. } => EventOutcome::Continue,
        }
    }
}

/// Plugin events carry their own error values; the session forwards
/// them unchanged apart from classifying unknown kinds as `Unknown`
/// (spec.md §7).
fn classify_error(kind: &str, message: String) -> SsoError {
    match kind {
        "PermissionDenied" => SsoError::PermissionDenied,
        "IdentityNotFound" => SsoError::IdentityNotFound,
        "ReferenceNotFound" => SsoError::ReferenceNotFound,
        "MethodNotKnown" => SsoError::MethodNotKnown(message),
        "MethodNotAvailable" => SsoError::MethodNotAvailable(message),
        "MechanismNotAvailable" => SsoError::MechanismNotAvailable(message),
        "CredentialsNotAvailable" => SsoError::CredentialsNotAvailable,
        "NotAuthorized" => SsoError::NotAuthorized,
        "MissingData" => SsoError::MissingData(message),
        "InvalidData" => SsoError::InvalidData(message),
        "UserInteraction" => SsoError::UserInteraction(message),
        "SessionCanceled" => SsoError::SessionCanceled,
        "Timeout" => SsoError::Timeout,
        "StoreFailed" => SsoError::StoreFailed(message),
        "RemoveFailed" => SsoError::RemoveFailed(message),
        "PluginDied" => SsoError::PluginDied,
        "ProtocolError" => SsoError::ProtocolError(message),
        _ => SsoError::Unknown(message),
    }
}
