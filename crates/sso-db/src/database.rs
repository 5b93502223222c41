use anyhow::Context;
use sqlite::{Connection, ConnectionThreadSafe};
use sso_dictionary::{SsoError, SsoResult};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::spawn_blocking;

const BUSY_TIMEOUT: Duration = Duration::from_secs(60);

/// Thread-safe handle to a single SQLite file, shared by the Metadata
/// and Secret stores. Blocking SQL calls are pushed onto a blocking
/// thread pool so the async runtime's worker threads are never stalled
/// waiting on local disk I/O.
#[derive(Clone)]
pub struct Database {
    db: Arc<ConnectionThreadSafe>,
}

impl Database {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let mut db = Connection::open_thread_safe(path)
            .with_context(|| format!("failed to open database {path}"))?;

        db.set_busy_timeout(
            BUSY_TIMEOUT
                .as_millis()
                .try_into()
                .expect("timeout to be in range"),
        )?;
        db.execute("PRAGMA synchronous = OFF")?;

        Ok(Self { db: Arc::new(db) })
    }

    /// An in-memory database, used by tests and by callers that never
    /// need the store to survive process exit.
    pub fn open_memory() -> anyhow::Result<Self> {
        Self::open(":memory:")
    }

    /// Carry out the blocking operation on the database connection,
    /// logging slow operations and classifying `SQLITE_BUSY` specially
    /// so callers can apply bounded backoff.
    pub async fn perform<T: Send + 'static>(
        &self,
        reason: impl Into<String>,
        mut func: impl FnMut(&ConnectionThreadSafe) -> anyhow::Result<T> + Send + 'static,
    ) -> anyhow::Result<T> {
        let db = self.db.clone();
        let start = Instant::now();
        let reason = reason.into();
        let result = spawn_blocking(move || (func)(&db)).await?.map_err(|err| {
            if let Some(s) = err.root_cause().downcast_ref::<sqlite::Error>() {
                if let Some(code) = s.code {
                    if code == sqlite::ffi::SQLITE_BUSY as isize {
                        return err.context(format!(
                            "failed to acquire database within {BUSY_TIMEOUT:?}"
                        ));
                    }
                }
            }
            err
        });
        let took = start.elapsed();
        if took > Duration::from_secs(1) {
            let is_ok = result.is_ok();
            tracing::warn!("Database::perform {reason} took {took:?}. is_ok={is_ok}");
        }
        result
    }

    /// Runs a batch of schema-definition statements synchronously.
    /// Only used at store-open time, before any async callers exist.
    pub fn execute_schema(&self, sql: &str) -> anyhow::Result<()> {
        self.db.execute(sql).map_err(Into::into)
    }

    /// True iff `err`'s root cause is an `SQLITE_BUSY` condition, used
    /// by callers that want to apply their own bounded-backoff retry
    /// per spec.md §7's "Transient DB errors (busy) are retried with
    /// bounded backoff".
    pub fn is_busy(err: &anyhow::Error) -> bool {
        err.root_cause()
            .downcast_ref::<sqlite::Error>()
            .and_then(|s| s.code)
            .map(|code| code == sqlite::ffi::SQLITE_BUSY as isize)
            .unwrap_or(false)
    }
}

/// Common connection-lifecycle helper shared by the Metadata and
/// Secret stores: `open`/`close`/`is_open`/`clear`/`last_error`, per
/// spec.md §4.6. Closing drops the underlying connection; a later
/// `open` re-creates it against the same path, re-running schema
/// initialization (`CREATE TABLE IF NOT EXISTS`, so this is safe on an
/// existing file).
pub struct StoreHandle {
    path: String,
    state: Mutex<Option<Database>>,
    last_error: Mutex<Option<String>>,
}

impl StoreHandle {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Opens the database file and runs `init_sql` against it. A
    /// second call to `open` while already open is a no-op.
    pub async fn open(&self, init_sql: &'static str) -> SsoResult<()> {
        if self.is_open() {
            return Ok(());
        }
        let path = self.path.clone();
        let db = Database::open(&path)
            .and_then(|db| {
                // Schema init runs inline at open time; it's a handful
                // of CREATE TABLE IF NOT EXISTS statements and doesn't
                // warrant its own blocking-pool round trip.
                db.execute_schema(init_sql)?;
                Ok(db)
            })
            .map_err(|err| self.record(err))?;
        *self.state.lock().unwrap() = Some(db);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    pub async fn close(&self) {
        self.state.lock().unwrap().take();
    }

    /// Deletes all rows from the tables named in `clear_sql` (a
    /// semicolon-separated list of `DELETE FROM ...` statements).
    /// Requires keychain-context authorization at the caller layer;
    /// this helper performs no ACL check itself.
    pub async fn clear(&self, clear_sql: &'static str) -> SsoResult<()> {
        let db = self.db()?;
        db.perform("clear", move |conn| conn.execute(clear_sql).map_err(Into::into))
            .await
            .map_err(|err| self.record(err))
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    pub fn db(&self) -> SsoResult<Database> {
        self.state
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SsoError::Unknown("database is not open".into()))
    }

    fn record(&self, err: anyhow::Error) -> SsoError {
        let msg = format!("{err:#}");
        *self.last_error.lock().unwrap() = Some(msg.clone());
        SsoError::Unknown(msg)
    }
}

/// Retries `op` with bounded exponential backoff while it fails with
/// `SQLITE_BUSY`. Used by the two-phase store sequence and anywhere
/// else a transient lock contention should not surface to the caller.
pub async fn with_busy_retry<T, F, Fut>(mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    const MAX_ATTEMPTS: u32 = 5;
    let mut delay = Duration::from_millis(10);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) if Database::is_busy(&err) && attempt + 1 < MAX_ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}
