// crates/memvault-gateway/src/db/pool.rs
// Async connection pool using deadpool-sqlite
//
// Use `pool.run()` from service code; it converts errors to `GatewayError`.
// `pool.interact()` is the lower-level form returning `anyhow::Result`,
// used for schema setup and tests.
//
// In-memory pools use a shared cache URI (`file:memdb_xxx?mode=memory&cache=shared`)
// so every pooled connection sees the same database.

use crate::error::GatewayError;
use anyhow::{Context, Result};
use deadpool_sqlite::{Config, Hook, Pool, Runtime};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::{Path, PathBuf};
use std::sync::Once;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Registers sqlite-vec extension globally (once per process).
/// Must be called before any SQLite connections are opened.
static SQLITE_VEC_INIT: Once = Once::new();

#[allow(clippy::missing_transmute_annotations)]
pub(crate) fn ensure_sqlite_vec_registered() {
    SQLITE_VEC_INIT.call_once(|| {
        // SAFETY: sqlite3_vec_init has the entry-point signature sqlite3_auto_extension
        // expects; the transmute only erases it to `extern "C" fn()`. The symbol is
        // statically linked so the pointer stays valid for the process lifetime.
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite3_vec_init as *const (),
            )));
        }
        tracing::debug!("sqlite-vec extension registered globally");
    });
}

/// SQLITE_BUSY (file databases under write contention) or SQLITE_LOCKED
/// (shared-cache in-memory databases).
fn is_rusqlite_contention(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

fn is_gateway_contention(err: &GatewayError) -> bool {
    match err {
        GatewayError::Db(e) => is_rusqlite_contention(e),
        _ => false,
    }
}

/// Retry delays for SQLite contention backoff (100ms, 500ms, 2s).
const RETRY_DELAYS: [std::time::Duration; 3] = [
    std::time::Duration::from_millis(100),
    std::time::Duration::from_millis(500),
    std::time::Duration::from_millis(2000),
];

async fn retry_with_backoff<F, Fut, R, E>(
    mut op: F,
    is_retryable: impl Fn(&E) -> bool,
) -> Result<R, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<R, E>>,
    E: std::fmt::Display,
{
    for (attempt, delay) in RETRY_DELAYS.iter().enumerate() {
        match op().await {
            Ok(result) => return Ok(result),
            Err(e) if is_retryable(&e) => {
                tracing::warn!(
                    "SQLite contention on attempt {}/{}, retrying in {:?}",
                    attempt + 1,
                    RETRY_DELAYS.len(),
                    delay
                );
                tokio::time::sleep(*delay).await;
            }
            Err(e) => return Err(e),
        }
    }

    // Final attempt (no retry after this)
    op().await
}

/// Pooled memory store with sqlite-vec loaded on every connection.
pub struct DatabasePool {
    pool: Pool,
    path: Option<PathBuf>,
    dimensions: usize,
}

enum DbStorage {
    File(PathBuf),
    InMemory { label: &'static str },
}

impl DatabasePool {
    /// Open (creating if needed) the store at `path` for embeddings of
    /// `dimensions` floats.
    pub async fn open(path: &Path, dimensions: usize) -> Result<Self> {
        Self::open_internal(DbStorage::File(path.to_path_buf()), dimensions).await
    }

    /// Fresh in-memory store, mostly for tests.
    pub async fn open_in_memory(dimensions: usize) -> Result<Self> {
        Self::open_internal(DbStorage::InMemory { label: "memdb" }, dimensions).await
    }

    async fn open_internal(storage: DbStorage, dimensions: usize) -> Result<Self> {
        ensure_sqlite_vec_registered();

        let (conn_str, path, hook) = match storage {
            DbStorage::File(p) => {
                ensure_parent_directory(&p)?;
                let s = p.to_string_lossy().into_owned();
                let hook = make_file_post_create_hook(p.clone());
                (s, Some(p), hook)
            }
            DbStorage::InMemory { label } => {
                let uri = format!(
                    "file:{}_{}?mode=memory&cache=shared",
                    label,
                    uuid::Uuid::new_v4().simple()
                );
                (uri, None, make_memory_post_create_hook())
            }
        };

        let pool = Config::new(&conn_str)
            .builder(Runtime::Tokio1)
            .context("Failed to create pool builder")?
            .max_size(8)
            .post_create(hook)
            .build()
            .context("Failed to build connection pool")?;

        let db_pool = Self {
            pool,
            path,
            dimensions,
        };

        db_pool
            .interact(move |conn| {
                super::schema::run_migrations(conn, dimensions)?;
                if let Err(e) = conn.execute_batch("PRAGMA optimize") {
                    tracing::debug!("PRAGMA optimize skipped: {}", e);
                }
                Ok(())
            })
            .await?;

        Ok(db_pool)
    }

    /// Run a closure with a pooled connection on a blocking thread.
    pub async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get connection from pool")?;

        conn.interact(move |conn| f(conn))
            .await
            .map_err(|e| anyhow::anyhow!("interact failed: {e}"))?
    }

    /// Like [`interact`](Self::interact) but errors come back as `GatewayError`.
    pub async fn run<F, R, E>(&self, f: F) -> Result<R, GatewayError>
    where
        F: FnOnce(&Connection) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: Into<GatewayError> + Send + 'static,
    {
        self.pool
            .get()
            .await
            .map_err(|e| GatewayError::StorageFailure(format!("Failed to get connection: {e}")))?
            .interact(move |conn| f(conn).map_err(Into::into))
            .await
            .map_err(|e| GatewayError::StorageFailure(format!("Database error: {e}")))?
    }

    /// [`run`](Self::run) with backoff on SQLite contention. For writes
    /// that must not be lost; the closure is cloned per attempt.
    pub async fn run_with_retry<F, R, E>(&self, f: F) -> Result<R, GatewayError>
    where
        F: FnOnce(&Connection) -> Result<R, E> + Send + Clone + 'static,
        R: Send + 'static,
        E: Into<GatewayError> + Send + 'static,
    {
        retry_with_backoff(
            || {
                let f_clone = f.clone();
                self.run(f_clone)
            },
            is_gateway_contention,
        )
        .await
    }

    /// Embedding width every record in this store has.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Database file path (None for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Ensure parent directory exists with secure permissions (0o700 on Unix).
fn ensure_parent_directory(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            let mut perms = std::fs::metadata(parent)?.permissions();
            perms.set_mode(0o700);
            std::fs::set_permissions(parent, perms)?;
        }
    }
    Ok(())
}

/// PRAGMAs plus 0o600 on the database file.
fn make_file_post_create_hook(path: PathBuf) -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        let path_for_perms = path.clone();
        Box::pin(async move {
            conn.interact(move |conn| {
                setup_connection(conn)?;

                #[cfg(unix)]
                if let Ok(metadata) = std::fs::metadata(&path_for_perms) {
                    let mut perms = metadata.permissions();
                    perms.set_mode(0o600);
                    if let Err(e) = std::fs::set_permissions(&path_for_perms, perms) {
                        tracing::warn!("Failed to set database file permissions to 0600: {}", e);
                    }
                }
                #[cfg(not(unix))]
                let _ = &path_for_perms;

                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into())
            })?
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into())
            })
        })
    })
}

/// WAL does not apply to in-memory databases.
fn make_memory_post_create_hook() -> Hook {
    Hook::async_fn(|conn, _metrics| {
        Box::pin(async move {
            conn.interact(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys=ON; \
                     PRAGMA busy_timeout=5000;",
                )?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into())
            })?
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into())
            })
        })
    })
}

fn setup_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL; \
         PRAGMA foreign_keys=ON; \
         PRAGMA busy_timeout=5000; \
         PRAGMA synchronous=NORMAL; \
         PRAGMA journal_size_limit=32768;",
    )?;
    Ok(())
}
