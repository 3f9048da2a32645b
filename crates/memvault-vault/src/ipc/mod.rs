// crates/memvault-vault/src/ipc/mod.rs
// Local-only transport for the vault: Unix socket or named pipe

pub mod handler;
pub mod locks;


pub use handler::{VaultState, handle_connection, handle_request};

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How long an accepted connection waits for a free slot
const SLOT_WAIT: Duration = Duration::from_secs(2);

const OVERLOADED: &[u8] = b"{\"Error\":\"storage_failure: server overloaded\"}\n";

/// Returns the path to the vault socket (~/.memvault/vault.sock).
///
/// Without HOME, prefers `$XDG_RUNTIME_DIR` (per-user, 0700) over `/tmp`.
/// The `/tmp` fallback includes the UID so another user cannot squat on it.
#[cfg(unix)]
pub fn socket_path() -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        return home.join(".memvault").join("vault.sock");
    }

    warn!("HOME directory not set, using fallback for vault socket");

    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("memvault").join("vault.sock");
    }

    // SAFETY: getuid has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/memvault-{uid}")).join("vault.sock")
}

/// Returns the named pipe for the vault on Windows:
/// `\\.\pipe\memvault-vault-{username}`.
#[cfg(windows)]
pub fn pipe_name() -> String {
    let username = std::env::var("USERNAME").unwrap_or_else(|_| "default".to_string());
    format!(r"\\.\pipe\memvault-vault-{username}")
}

/// Platform default address clients connect to.
pub fn default_endpoint() -> PathBuf {
    #[cfg(unix)]
    {
        socket_path()
    }
    #[cfg(windows)]
    {
        PathBuf::from(pipe_name())
    }
}

/// Serve vault requests on a Unix socket until `shutdown` resolves.
/// The socket file is removed on the way out.
#[cfg(unix)]
pub async fn run_listener(
    state: VaultState,
    path: &Path,
    max_connections: usize,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.exists()
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::create_dir_all(parent)?;
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
    }

    if path.exists() {
        if tokio::net::UnixStream::connect(path).await.is_ok() {
            anyhow::bail!("another vault daemon is already listening on {}", path.display());
        }
        std::fs::remove_file(path)?;
    }

    // Restrictive umask before bind so the socket is owner-only from the
    // moment it exists.
    // SAFETY: umask only swaps the process file-mode mask.
    let old_umask = unsafe { libc::umask(0o177) };
    let bind_result = tokio::net::UnixListener::bind(path);
    // SAFETY: as above.
    unsafe { libc::umask(old_umask) };
    let listener = bind_result?;

    info!(socket = %path.display(), "Vault listening");

    let semaphore = Arc::new(tokio::sync::Semaphore::new(max_connections));
    tokio::pin!(shutdown);

    loop {
        let accepted = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _addr)) => {
                let permit =
                    match tokio::time::timeout(SLOT_WAIT, semaphore.clone().acquire_owned()).await
                    {
                        Ok(Ok(p)) => p,
                        Ok(Err(_)) => break,
                        Err(_) => {
                            warn!("Vault: connection limit reached after 2s, rejecting");
                            let _ = stream.try_write(OVERLOADED);
                            continue;
                        }
                    };
                let state = state.clone();
                tokio::spawn(async move {
                    handle_connection(stream, state).await;
                    drop(permit);
                });
            }
            Err(e) => warn!(error = %e, "Vault accept error"),
        }
    }

    info!("Vault shutting down");
    if let Err(e) = std::fs::remove_file(path) {
        warn!(error = %e, "Failed to remove vault socket");
    }
    Ok(())
}

/// Serve vault requests on a Windows named pipe until `shutdown` resolves.
///
/// A new pipe instance is created before the connected one is handed off,
/// so a listening instance always exists.
#[cfg(windows)]
pub async fn run_listener(
    state: VaultState,
    path: &Path,
    max_connections: usize,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    use tokio::net::windows::named_pipe::ServerOptions;

    let name = path.as_os_str();
    let mut pipe = ServerOptions::new()
        .first_pipe_instance(true)
        .reject_remote_clients(true)
        .create(name)?;

    info!(pipe = %path.display(), "Vault listening");

    let semaphore = Arc::new(tokio::sync::Semaphore::new(max_connections));
    tokio::pin!(shutdown);

    loop {
        let connected = tokio::select! {
            _ = &mut shutdown => break,
            connected = pipe.connect() => connected,
        };
        if let Err(e) = connected {
            warn!(error = %e, "Vault pipe connect error");
            continue;
        }

        let next_pipe = match ServerOptions::new().reject_remote_clients(true).create(name) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Vault: failed to create next pipe instance");
                handle_connection(pipe, state.clone()).await;
                pipe = ServerOptions::new().reject_remote_clients(true).create(name)?;
                continue;
            }
        };
        let connected_pipe = std::mem::replace(&mut pipe, next_pipe);

        let permit = match tokio::time::timeout(SLOT_WAIT, semaphore.clone().acquire_owned()).await {
            Ok(Ok(p)) => p,
            Ok(Err(_)) => break,
            Err(_) => {
                warn!("Vault: connection limit reached after 2s, rejecting");
                let _ = connected_pipe.try_write(OVERLOADED);
                continue;
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            handle_connection(connected_pipe, state).await;
            drop(permit);
        });
    }

    info!("Vault shutting down");
    Ok(())
}
