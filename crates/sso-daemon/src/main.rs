use anyhow::Context;
use clap::{Parser, ValueEnum};
use sso_acm::{AllowAllPlatformPolicy, DefaultAcm};
use sso_daemon::{Daemon, DaemonConfig};
use sso_db::Store;
use sso_dictionary::SecurityContext;
use sso_storage::{DefaultStorageManager, StorageManager};
use sso_ui::{NullUiAgent, UiBroker};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;

/// How diagnostic logs render. full/compact/pretty are intended for
/// human consumption; json is for machine-readable ingestion.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab_case")]
enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

/// SSO authentication daemon.
#[derive(Debug, Parser)]
#[command(about, version = version_info::ssod_version())]
struct Opt {
    /// Path to the daemon's TOML configuration file.
    ///
    /// If omitted, built-in defaults are used (see spec.md §6's keys
    /// table), still subject to the `SSO_*` environment overrides.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory where diagnostic log files will be placed.
    ///
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render.
    #[arg(long, value_enum, default_value = "full")]
    diag_format: DiagnosticFormat,

    /// The username whose per-user secure directory this daemon
    /// instance manages.
    #[arg(long, default_value = "default")]
    user: String,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async move { run(opts).await })
}

/// Matches `tsa-daemon`'s `LoggingConfig`, trimmed of the Lua-specific
/// reloadable-filter hook and metrics/console layers that have no
/// counterpart here; `SSO_LOG` plays the role of `KUMO_TSA_LOG`.
fn init_logging(opts: &Opt) -> anyhow::Result<()> {
    let (_non_blocking, log_writer) = if let Some(log_dir) = &opts.diag_log_dir {
        let file_appender = tracing_appender::rolling::daily(log_dir, "ssod.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        (Some(guard), BoxMakeWriter::new(non_blocking))
    } else {
        (None, BoxMakeWriter::new(std::io::stderr))
    };
    // Leaking the guard keeps the background flush thread alive for
    // the process lifetime; there is no later point at which dropping
    // it would be meaningful.
    if let Some(guard) = _non_blocking {
        Box::leak(Box::new(guard));
    }

    let layer = tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_writer(log_writer);
    let layer = match opts.diag_format {
        DiagnosticFormat::Pretty => layer.pretty().boxed(),
        DiagnosticFormat::Full => layer.boxed(),
        DiagnosticFormat::Compact => layer.compact().boxed(),
        DiagnosticFormat::Json => layer.json().boxed(),
    };

    let env_filter = tracing_subscriber::EnvFilter::try_new(
        std::env::var("SSO_LOG").as_deref().unwrap_or("sso_daemon=info,sso_identity=info"),
    )
    .context("parsing SSO_LOG filter")?;

    tracing_subscriber::registry().with(layer.with_filter(env_filter)).init();
    Ok(())
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    init_logging(&opts)?;

    let config = DaemonConfig::load(opts.config.as_deref()).context("loading daemon configuration")?;

    let storage_manager: Arc<dyn StorageManager> =
        Arc::new(DefaultStorageManager::new(&config.general.storage_path, &opts.user));
    storage_manager
        .mount_filesystem()
        .await
        .map_err(|err| anyhow::anyhow!("mounting secure storage: {err}"))?;

    let store = Arc::new(Store::new(
        config.metadata_db_path().to_string_lossy().into_owned(),
        config.secret_db_path().to_string_lossy().into_owned(),
    ));
    store.open().await.map_err(|err| anyhow::anyhow!("opening stores: {err}"))?;

    let acm: Arc<dyn sso_acm::AccessControlManager> = Arc::new(DefaultAcm::new(
        SecurityContext::new("keychain", sso_dictionary::WILDCARD),
        AllowAllPlatformPolicy,
    ));
    let ui = UiBroker::new(Arc::new(NullUiAgent::new()));

    let daemon = Daemon::new(config, store.clone(), storage_manager.clone(), acm, ui);

    let mut lifecycle = sso_server_lifecycle::LifeCycle::new();

    let sweep_daemon = daemon.clone();
    let sweep_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            if sso_server_lifecycle::is_shutting_down() {
                break;
            }
            sweep_daemon.sweep().await;
            if sweep_daemon.is_idle_past_timeout().await {
                tracing::info!("daemon idle past DaemonTimeout, requesting shutdown");
                sso_server_lifecycle::LifeCycle::request_shutdown().await;
                break;
            }
        }
    });

    tracing::info!(methods = ?daemon.query_methods(), "ssod ready");
    lifecycle.wait_for_shutdown().await;

    sweep_task.abort();
    store.close().await;
    storage_manager
        .unmount_filesystem()
        .await
        .map_err(|err| anyhow::anyhow!("unmounting secure storage: {err}"))?;

    Ok(())
}
