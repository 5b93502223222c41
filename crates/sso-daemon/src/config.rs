//! `DaemonConfig` (spec.md §6's recognized-keys table). Config
//! *parsing* is implemented even though transports are out of scope,
//! since the keys and their defaults are real daemon behavior: where
//! identities/secrets live on disk, how long idle objects survive, and
//! which plugin/extension directories to scan.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_secret_db_filename() -> String {
    "secret.db".to_string()
}

fn default_metadata_db_filename() -> String {
    "metadata.db".to_string()
}

fn default_plugins_dir() -> PathBuf {
    PathBuf::from("/usr/libexec/ssod")
}

fn default_plugin_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_daemon_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_identity_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_auth_session_timeout() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSection {
    #[serde(rename = "StoragePath")]
    pub storage_path: PathBuf,
    #[serde(rename = "SecureDir")]
    pub secure_dir: Option<PathBuf>,
    #[serde(rename = "ExtensionsDir")]
    pub extensions_dir: Option<PathBuf>,
    #[serde(rename = "PluginsDir", default = "default_plugins_dir")]
    pub plugins_dir: PathBuf,
    #[serde(rename = "BinDir")]
    pub bin_dir: Option<PathBuf>,
    #[serde(rename = "Extension")]
    pub extension: Option<String>,
    #[serde(rename = "PluginTimeout", with = "duration_serde", default = "default_plugin_timeout")]
    pub plugin_timeout: Duration,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("/var/lib/ssod"),
            secure_dir: None,
            extensions_dir: None,
            plugins_dir: default_plugins_dir(),
            bin_dir: None,
            extension: None,
            plugin_timeout: default_plugin_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    #[serde(rename = "SecretDBFilename", default = "default_secret_db_filename")]
    pub secret_db_filename: String,
    #[serde(rename = "MetadataDBFilename", default = "default_metadata_db_filename")]
    pub metadata_db_filename: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            secret_db_filename: default_secret_db_filename(),
            metadata_db_filename: default_metadata_db_filename(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectTimeoutsSection {
    #[serde(rename = "DaemonTimeout", with = "duration_serde", default = "default_daemon_timeout")]
    pub daemon_timeout: Duration,
    #[serde(rename = "IdentityTimeout", with = "duration_serde", default = "default_identity_timeout")]
    pub identity_timeout: Duration,
    #[serde(rename = "AuthSessionTimeout", with = "duration_serde", default = "default_auth_session_timeout")]
    pub auth_session_timeout: Duration,
}

impl Default for ObjectTimeoutsSection {
    fn default() -> Self {
        Self {
            daemon_timeout: default_daemon_timeout(),
            identity_timeout: default_identity_timeout(),
            auth_session_timeout: default_auth_session_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    #[serde(rename = "General")]
    pub general: GeneralSection,
    #[serde(rename = "Storage")]
    pub storage: StorageSection,
    #[serde(rename = "ObjectTimeouts")]
    pub object_timeouts: ObjectTimeoutsSection,

    /// Set only from `SSO_SECRET_PATH`; when present it overrides the
    /// `General/StoragePath` + `Storage/SecretDBFilename` join outright
    /// rather than feeding into it, since the env var in spec.md §6
    /// names a full path, not a filename.
    #[serde(skip)]
    pub secret_path_override: Option<PathBuf>,
}

impl DaemonConfig {
    /// Loads the TOML file at `path`, if given, then applies the nine
    /// `SSO_*` overrides from spec.md §6 on top of it. Matches
    /// `tsa-daemon`/`kumod`'s pattern: read the environment once at
    /// startup, log what was applied, fold it over the parsed file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str(&text)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => DaemonConfig::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies `SSO_STORAGE_PATH`, `SSO_PLUGIN_TIMEOUT`,
    /// `SSO_DAEMON_TIMEOUT`, `SSO_IDENTITY_TIMEOUT`,
    /// `SSO_AUTH_SESSION_TIMEOUT`, `SSO_EXTENSION`, `SSO_EXTENSIONS_DIR`,
    /// `SSO_PLUGINS_DIR`, and `SSO_SECRET_PATH` over the parsed config,
    /// logging each one applied at `debug`.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_path("SSO_STORAGE_PATH") {
            self.general.storage_path = v;
        }
        if let Some(v) = env_duration("SSO_PLUGIN_TIMEOUT") {
            self.general.plugin_timeout = v;
        }
        if let Some(v) = env_duration("SSO_DAEMON_TIMEOUT") {
            self.object_timeouts.daemon_timeout = v;
        }
        if let Some(v) = env_duration("SSO_IDENTITY_TIMEOUT") {
            self.object_timeouts.identity_timeout = v;
        }
        if let Some(v) = env_duration("SSO_AUTH_SESSION_TIMEOUT") {
            self.object_timeouts.auth_session_timeout = v;
        }
        if let Some(v) = env_string("SSO_EXTENSION") {
            self.general.extension = Some(v);
        }
        if let Some(v) = env_path("SSO_EXTENSIONS_DIR") {
            self.general.extensions_dir = Some(v);
        }
        if let Some(v) = env_path("SSO_PLUGINS_DIR") {
            self.general.plugins_dir = v;
        }
        if let Some(v) = env_path("SSO_SECRET_PATH") {
            self.secret_path_override = Some(v);
        }
    }

    pub fn secret_db_path(&self) -> PathBuf {
        if let Some(path) = &self.secret_path_override {
            return path.clone();
        }
        self.general.storage_path.join(&self.storage.secret_db_filename)
    }

    pub fn metadata_db_path(&self) -> PathBuf {
        self.general.storage_path.join(&self.storage.metadata_db_filename)
    }
}

fn env_string(name: &str) -> Option<String> {
    let value = std::env::var(name).ok()?;
    tracing::debug!(name, value = %value, "applying env override");
    Some(value)
}

fn env_path(name: &str) -> Option<PathBuf> {
    env_string(name).map(PathBuf::from)
}

fn env_duration(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    let parsed = match raw.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => match humantime::parse_duration(&raw) {
            Ok(d) => d,
            Err(err) => {
                tracing::warn!(name, value = %raw, %err, "ignoring unparsable duration override");
                return None;
            }
        },
    };
    tracing::debug!(name, value = %raw, "applying env override");
    Some(parsed)
}
