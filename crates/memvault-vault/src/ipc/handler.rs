// crates/memvault-vault/src/ipc/handler.rs
// Per-connection handler for vault requests

use super::locks::KeyLocks;
use crate::error::Result;
use crate::keystore::{KeyStore, validate_key_id};
use crate::protocol::{ErrorCode, VaultRequest, VaultResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

/// Maximum size of a single request line (1 MB).
const MAX_LINE_SIZE: usize = 1_048_576;

/// Everything a connection needs. Created once at startup and cloned into
/// each connection task.
#[derive(Clone)]
pub struct VaultState {
    pub store: Arc<dyn KeyStore>,
    pub locks: Arc<KeyLocks>,
    pub request_timeout: Duration,
}

impl VaultState {
    pub fn new(store: Arc<dyn KeyStore>, request_timeout: Duration) -> Self {
        Self {
            store,
            locks: Arc::new(KeyLocks::new()),
            request_timeout,
        }
    }
}

/// Serve one client connection: read a request line, answer it, repeat
/// until EOF.
///
/// Generic over the stream type so Unix sockets and named pipes share it.
pub async fn handle_connection<S>(stream: S, state: VaultState)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut writer = writer;

    loop {
        // Bounded read via fill_buf/consume so an oversized line is rejected
        // before it is buffered. The buffer may hold key bytes. The rest of
        // an oversized line is discarded up to its newline.
        let mut buf = Zeroizing::new(Vec::new());
        let mut eof = false;
        let mut too_large = false;
        loop {
            let available = match reader.fill_buf().await {
                Ok([]) => {
                    eof = true;
                    break;
                }
                Ok(b) => b,
                Err(e) => {
                    debug!(error = %e, "Vault connection read error");
                    return;
                }
            };
            let newline_pos = available.iter().position(|&b| b == b'\n');
            let end = newline_pos.map(|p| p + 1).unwrap_or(available.len());
            if !too_large && buf.len() + end > MAX_LINE_SIZE {
                too_large = true;
                buf.zeroize();
            }
            if !too_large {
                buf.extend_from_slice(&available[..end]);
            }
            reader.consume(end);
            if newline_pos.is_some() {
                break;
            }
        }
        if too_large {
            warn!("Oversized vault request discarded");
            let resp = VaultResponse::error(
                ErrorCode::InvalidRequest,
                format!("request too large (max {MAX_LINE_SIZE} bytes)"),
            );
            if write_response(&mut writer, &resp).await.is_err() || eof {
                break;
            }
            continue;
        }
        if eof {
            break;
        }

        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let req: VaultRequest = match serde_json::from_slice(&buf) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Malformed vault request");
                let resp = VaultResponse::error(ErrorCode::InvalidRequest, format!("parse error: {e}"));
                if write_response(&mut writer, &resp).await.is_err() {
                    break;
                }
                continue;
            }
        };
        drop(buf);

        let kind = req.kind();
        debug!(request = kind, key_id = ?req.key_id(), "Vault request");

        let resp = match tokio::time::timeout(state.request_timeout, handle_request(&state, req))
            .await
        {
            Ok(resp) => resp,
            Err(_) => {
                warn!(request = kind, "Vault request timed out");
                VaultResponse::error(ErrorCode::Timeout, "request timed out")
            }
        };

        if write_response(&mut writer, &resp).await.is_err() {
            break; // Client disconnected
        }
    }
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    resp: &VaultResponse,
) -> std::io::Result<()> {
    let mut line = Zeroizing::new(serde_json::to_vec(resp).unwrap_or_else(|_| {
        br#"{"Error":"storage_failure: response serialization failed"}"#.to_vec()
    }));
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Execute one request against the key store.
pub async fn handle_request(state: &VaultState, req: VaultRequest) -> VaultResponse {
    let result = match req {
        VaultRequest::Ping => Ok(VaultResponse::Pong),
        VaultRequest::StoreKey {
            key_id,
            key_data,
            metadata,
            expires_at,
        } => {
            let id = key_id.clone();
            with_key_lock(state, &key_id, move |store| {
                store.store(&id, &key_data, &metadata, expires_at)
            })
            .await
            .map(|()| VaultResponse::Success)
        }
        VaultRequest::RetrieveKey { key_id } => {
            let id = key_id.clone();
            with_key_lock(state, &key_id, move |store| store.retrieve(&id))
                .await
                .map(|record| VaultResponse::KeyData {
                    key_data: Zeroizing::new(record.key.expose().to_vec()),
                    metadata: record.metadata,
                    created_at: record.created_at,
                    expires_at: record.expires_at,
                })
        }
        VaultRequest::DeleteKey { key_id } => {
            let id = key_id.clone();
            with_key_lock(state, &key_id, move |store| store.delete(&id))
                .await
                .map(|()| VaultResponse::Success)
        }
        VaultRequest::KeyExists { key_id } => {
            let id = key_id.clone();
            let exists = with_key_lock(state, &key_id, move |store| Ok(store.exists(&id)))
                .await
                .unwrap_or_else(|e| {
                    debug!(key_id, error = %e, "Existence check failed; reporting absent");
                    false
                });
            Ok(VaultResponse::Exists(exists))
        }
        VaultRequest::ListKeys => {
            let store = state.store.clone();
            match tokio::task::spawn_blocking(move || store.list_keys()).await {
                Ok(listed) => listed.map(VaultResponse::KeyList),
                Err(e) => Err(e.into()),
            }
        }
    };

    result.unwrap_or_else(|e| {
        if e.is_not_found() {
            debug!(error = %e, "Vault request: not found");
        } else {
            warn!(error = %e, "Vault request failed");
        }
        VaultResponse::from_error(&e)
    })
}

/// Run `op` on a blocking thread while holding the lock for `key_id`.
///
/// The owned guard moves into the blocking closure, so the lock is released
/// when the store call finishes and not when the awaiting request is dropped.
async fn with_key_lock<T, F>(state: &VaultState, key_id: &str, op: F) -> Result<T>
where
    F: FnOnce(&dyn KeyStore) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    validate_key_id(key_id)?;
    let guard = state.locks.acquire(key_id).await;
    let store = state.store.clone();
    tokio::task::spawn_blocking(move || {
        let _guard = guard;
        op(store.as_ref())
    })
    .await?
}
