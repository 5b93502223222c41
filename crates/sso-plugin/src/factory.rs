use crate::proxy::PluginProxy;
use sso_dictionary::{SsoError, SsoResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const BINARY_PREFIX: &str = "ssod-plugin-";

struct Entry {
    proxy: Arc<PluginProxy>,
    refcount: usize,
    generation: u64,
}

/// Keeps at most one live proxy per method, shared by reference among
/// the sessions currently using it; disposes the process after an idle
/// window once the last session releases it (spec.md §4.4, C6).
///
/// Method names are resolved to binaries named `ssod-plugin-<method>`
/// under `plugin_dir` — the daemon's convention for locating the
/// out-of-process plugins described in spec.md §9's re-architecture
/// guidance (externalize in-process plugin objects as OS processes).
pub struct PluginFactory {
    plugin_dir: PathBuf,
    idle_timeout: Duration,
    proxies: Mutex<HashMap<String, Entry>>,
    generation: AtomicU64,
}

impl PluginFactory {
    pub fn new(plugin_dir: impl Into<PathBuf>, idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            plugin_dir: plugin_dir.into(),
            idle_timeout,
            proxies: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    fn binary_path(&self, method: &str) -> PathBuf {
        self.plugin_dir.join(format!("{BINARY_PREFIX}{method}"))
    }

    /// Methods for which a plugin binary exists in `plugin_dir`,
    /// sorted for deterministic `query_methods()` output.
    pub fn query_methods(&self) -> Vec<String> {
        let mut methods = list_plugin_methods(&self.plugin_dir);
        methods.sort();
        methods
    }

    /// Acquires (spawning if necessary) the shared proxy for `method`.
    /// Fails with `MethodNotKnown` if no plugin binary provides it.
    /// Cancels any pending idle-eviction timer for this method.
    pub async fn acquire(self: &Arc<Self>, method: &str) -> SsoResult<Arc<PluginProxy>> {
        let mut proxies = self.proxies.lock().await;

        if let Some(entry) = proxies.get_mut(method) {
            if !entry.proxy.is_dead() {
                entry.refcount += 1;
                entry.generation = self.generation.fetch_add(1, Ordering::SeqCst);
                return Ok(entry.proxy.clone());
            }
            proxies.remove(method);
        }

        let binary = self.binary_path(method);
        if !binary.is_file() {
            return Err(SsoError::MethodNotKnown(method.to_string()));
        }

        let proxy = PluginProxy::spawn(method, &binary)?;
        proxies.insert(
            method.to_string(),
            Entry {
                proxy: proxy.clone(),
                refcount: 1,
                generation: self.generation.fetch_add(1, Ordering::SeqCst),
            },
        );
        Ok(proxy)
    }

    /// Releases one reference to `method`'s proxy. Once the refcount
    /// reaches zero, starts the idle-eviction timer; reacquiring before
    /// it fires cancels the eviction (detected via the generation
    /// counter recorded at schedule time).
    pub async fn release(self: &Arc<Self>, method: &str) {
        let generation = {
            let mut proxies = self.proxies.lock().await;
            let Some(entry) = proxies.get_mut(method) else {
                return;
            };
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount != 0 {
                return;
            }
            entry.generation
        };

        let factory = self.clone();
        let method = method.to_string();
        let timeout = self.idle_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut proxies = factory.proxies.lock().await;
            if let Some(entry) = proxies.get(&method) {
                if entry.refcount == 0 && entry.generation == generation {
                    let entry = proxies.remove(&method).unwrap();
                    entry.proxy.shutdown().await;
                    tracing::debug!(%method, "plugin proxy evicted after idle timeout");
                }
            }
        });
    }

    /// Queries the mechanisms a plugin binary supports by invoking it
    /// with `--mechanisms`, one mechanism name per line of stdout. This
    /// is a one-shot subprocess call, independent of the persistent
    /// proxy used for the request/response protocol.
    pub async fn query_mechanisms(&self, method: &str) -> SsoResult<Vec<String>> {
        let binary = self.binary_path(method);
        if !binary.is_file() {
            return Err(SsoError::MethodNotKnown(method.to_string()));
        }
        let output = tokio::process::Command::new(&binary)
            .arg("--mechanisms")
            .output()
            .await
            .map_err(|err| SsoError::Unknown(format!("failed to query mechanisms: {err}")))?;
        if !output.status.success() {
            return Err(SsoError::Unknown(format!(
                "{method} --mechanisms exited with {}",
                output.status
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Test hook: the OS process id currently backing `method`'s proxy,
    /// if one is live. Used to assert pooling/eviction behavior (spec.md
    /// §8, property 6) without reaching into proxy internals elsewhere.
    pub async fn current_pid(&self, method: &str) -> Option<u32> {
        self.proxies.lock().await.get(method).map(|e| e.proxy.pid())
    }
}

fn list_plugin_methods(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            name.strip_prefix(BINARY_PREFIX).map(str::to_string)
        })
        .collect()
}
