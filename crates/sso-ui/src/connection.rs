use async_trait::async_trait;
use sso_dictionary::{Dictionary, SsoResult};
use std::sync::Mutex;

/// The connection to the external UI agent, reached over its own IPC
/// proxy with its own connect/disconnect lifecycle, per
/// `gsignond-signonui-proxy.c` / `gsignond-dbus-signonui-adapter.c`
/// (spec.md §4.5). Real deployments implement this against whatever
/// transport the UI helper process speaks; this crate ships only the
/// trait and a test double.
#[async_trait]
pub trait UiAgentConnection: Send + Sync {
    /// Establishes the connection. Called lazily, the first time a
    /// query needs dispatching while idle.
    async fn connect(&self) -> SsoResult<()>;

    /// Tears the connection down. Called after the 10-second idle
    /// timer fires with an empty queue.
    async fn disconnect(&self);

    /// Sends `data` to the UI agent on behalf of `caller`, the stable
    /// opaque id the agent will echo back on a later `refresh`.
    async fn send(&self, caller: &str, data: &Dictionary) -> SsoResult<()>;
}

/// A `UiAgentConnection` test double with no real transport: `connect`/
/// `disconnect` are no-ops, and `send` records the last payload sent so
/// tests can assert on it without standing up a UI helper process.
#[derive(Default)]
pub struct NullUiAgent {
    connected: Mutex<bool>,
    last_sent: Mutex<Option<(String, Dictionary)>>,
}

impl NullUiAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    pub fn last_sent(&self) -> Option<(String, Dictionary)> {
        self.last_sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl UiAgentConnection for NullUiAgent {
    async fn connect(&self) -> SsoResult<()> {
        *self.connected.lock().unwrap() = true;
        Ok(())
    }

    async fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    async fn send(&self, caller: &str, data: &Dictionary) -> SsoResult<()> {
        *self.last_sent.lock().unwrap() = Some((caller.to_string(), data.clone()));
        Ok(())
    }
}
