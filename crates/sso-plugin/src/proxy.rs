use sso_dictionary::{Dictionary, SsoError, SsoResult};
use sso_plugin_protocol::{decode_event, encode_request, Event, Request};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

/// A live connection to one method plugin's subprocess. Owned by the
/// [`crate::factory::PluginFactory`], shared by reference among the
/// sessions currently using this method (spec.md §4.4).
pub struct PluginProxy {
    method: String,
    pid: u32,
    stdin: AsyncMutex<ChildStdin>,
    next_tag: AtomicU64,
    pending: Mutex<HashMap<u64, mpsc::UnboundedSender<Event>>>,
    dialogs: Mutex<HashMap<String, u64>>,
    dead: AtomicBool,
    child: Mutex<Option<Child>>,
}

impl PluginProxy {
    /// Spawns the plugin binary and starts the inbound event pump.
    /// Returns `Err(Unknown)` if the process fails to start, per
    /// spec.md §4.4's "Proxy startup failure surfaces as
    /// `error(Unknown)`".
    pub fn spawn(method: &str, binary: &std::path::Path) -> SsoResult<std::sync::Arc<Self>> {
        let mut child = tokio::process::Command::new(binary)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| SsoError::Unknown(format!("failed to start plugin {method}: {err}")))?;

        let pid = child
            .id()
            .ok_or_else(|| SsoError::Unknown(format!("plugin {method} exited immediately")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SsoError::Unknown(format!("plugin {method} has no stdout")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SsoError::Unknown(format!("plugin {method} has no stdin")))?;

        let proxy = std::sync::Arc::new(Self {
            method: method.to_string(),
            pid,
            stdin: AsyncMutex::new(stdin),
            next_tag: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            dialogs: Mutex::new(HashMap::new()),
            dead: AtomicBool::new(false),
            child: Mutex::new(Some(child)),
        });

        let pump_proxy = proxy.clone();
        tokio::spawn(async move {
            pump_proxy.pump(stdout).await;
        });

        Ok(proxy)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    fn next_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::SeqCst)
    }

    /// Registers interest in a fresh tag and returns it along with a
    /// receiver for the events addressed to it.
    fn new_pending(&self) -> (u64, mpsc::UnboundedReceiver<Event>) {
        let tag = self.next_tag();
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().unwrap().insert(tag, tx);
        (tag, rx)
    }

    async fn send(&self, request: &Request) -> SsoResult<()> {
        if self.is_dead() {
            return Err(SsoError::PluginDied);
        }
        let line =
            encode_request(request).map_err(|err| SsoError::ProtocolError(err.to_string()))?;
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| SsoError::Unknown(format!("write to plugin {}: {err}", self.method)))?;
        stdin
            .flush()
            .await
            .map_err(|err| SsoError::Unknown(format!("flush to plugin {}: {err}", self.method)))
    }

    pub async fn request_initial(
        &self,
        mechanism: &str,
        params: Dictionary,
    ) -> SsoResult<(u64, mpsc::UnboundedReceiver<Event>)> {
        let (tag, rx) = self.new_pending();
        self.send(&Request::RequestInitial {
            tag,
            mechanism: mechanism.to_string(),
            params,
        })
        .await?;
        Ok((tag, rx))
    }

    pub async fn request(
        &self,
        mechanism: &str,
        params: Dictionary,
    ) -> SsoResult<(u64, mpsc::UnboundedReceiver<Event>)> {
        let (tag, rx) = self.new_pending();
        self.send(&Request::Request {
            tag,
            mechanism: mechanism.to_string(),
            params,
        })
        .await?;
        Ok((tag, rx))
    }

    /// Cancels the outstanding request for `tag`. Best-effort: the
    /// plugin may still emit a final event for this tag, which is
    /// discarded because the tag is freed immediately here.
    pub async fn cancel(&self, tag: u64) {
        self.pending.lock().unwrap().remove(&tag);
        self.dialogs.lock().unwrap().retain(|_, t| *t != tag);
        let _ = self.send(&Request::Cancel { tag }).await;
    }

    pub async fn user_action_finished(&self, tag: u64, data: Dictionary) -> SsoResult<()> {
        self.send(&Request::UserActionFinished { tag, data }).await
    }

    /// Routes a UI refresh by dialog id rather than tag (spec.md
    /// §4.4's "Refresh signals carry the dialog id ... not the tag").
    pub async fn refresh(&self, dialog_id: &str, data: Dictionary) -> SsoResult<()> {
        self.send(&Request::Refresh {
            dialog_id: dialog_id.to_string(),
            data,
        })
        .await
    }

    async fn pump(self: std::sync::Arc<Self>, stdout: tokio::process::ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match decode_event(&line) {
                        Ok(event) => self.dispatch(event),
                        Err(err) => {
                            tracing::warn!(
                                method = %self.method,
                                pid = self.pid,
                                %err,
                                "malformed plugin event, ignoring line"
                            );
                        }
                    }
                }
                Ok(None) => {
                    self.mark_dead();
                    break;
                }
                Err(err) => {
                    tracing::warn!(method = %self.method, %err, "plugin stdout read error");
                    self.mark_dead();
                    break;
                }
            }
        }
    }

    fn dispatch(&self, event: Event) {
        if let Event::UserActionRequired { tag, dialog_id, .. } = &event {
            self.dialogs.lock().unwrap().insert(dialog_id.clone(), *tag);
        }

        let tag = match &event {
            Event::Refreshed { dialog_id, .. } => {
                self.dialogs.lock().unwrap().get(dialog_id).copied()
            }
            other => other.tag(),
        };

        let Some(tag) = tag else {
            tracing::warn!(method = %self.method, "dropping event with no routable tag/dialog");
            return;
        };

        let terminal = event.is_terminal();
        let mut pending = self.pending.lock().unwrap();
        if let Some(sender) = pending.get(&tag) {
            let _ = sender.send(event);
            if terminal {
                pending.remove(&tag);
            }
        } else {
            tracing::warn!(method = %self.method, tag, "event for unknown/expired tag, discarding");
        }
    }

    fn mark_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
        let mut pending = self.pending.lock().unwrap();
        for (tag, sender) in pending.drain() {
            let _ = sender.send(Event::Error {
                tag,
                kind: "PluginDied".to_string(),
                message: "plugin process terminated unexpectedly".to_string(),
            });
        }
    }

    pub async fn shutdown(&self) {
        self.dead.store(true, Ordering::SeqCst);
        if let Some(mut child) = self.child.lock().unwrap().take() {
            let _ = child.start_kill();
        }
    }
}
