// crates/memvault-gateway/src/vault_client.rs
// Typed client for the vault daemon's line-delimited JSON protocol

use memvault_vault::SecureBuffer;
use memvault_vault::protocol::{ErrorCode, VaultRequest, VaultResponse};
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Largest response line accepted from the daemon
const MAX_RESPONSE_SIZE: u64 = 1_048_576;

#[cfg(unix)]
type Stream = tokio::net::UnixStream;
#[cfg(windows)]
type Stream = tokio::net::windows::named_pipe::NamedPipeClient;

#[derive(Error, Debug)]
pub enum VaultClientError {
    #[error("cannot reach vault: {0}")]
    ConnectionFailure(String),

    #[error("malformed vault response: {0}")]
    ProtocolError(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("vault error: {0}")]
    RemoteError(String),

    #[error("vault timed out after {0:?}")]
    Timeout(Duration),
}

impl VaultClientError {
    /// Transport-level failures worth another attempt on a fresh connection
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VaultClientError::ConnectionFailure(_) | VaultClientError::Timeout(_)
        )
    }
}

type Result<T> = std::result::Result<T, VaultClientError>;

#[derive(Debug, Clone)]
pub struct VaultClientConfig {
    /// Bound on one write + read exchange
    pub io_timeout: Duration,
    /// Bound on a whole call, retries and backoff included
    pub call_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for VaultClientConfig {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_millis(2000),
            call_timeout: Duration::from_millis(5000),
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(2000),
        }
    }
}

/// Key bytes plus what the vault recorded alongside them
#[derive(Debug)]
pub struct RetrievedKey {
    pub key: SecureBuffer,
    pub metadata: HashMap<String, String>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

struct Conn {
    reader: BufReader<ReadHalf<Stream>>,
    writer: WriteHalf<Stream>,
}

impl Conn {
    async fn open(endpoint: &Path) -> Result<Self> {
        #[cfg(unix)]
        let stream = Stream::connect(endpoint).await;
        #[cfg(windows)]
        let stream = tokio::net::windows::named_pipe::ClientOptions::new().open(endpoint);

        let stream = stream.map_err(|e| {
            VaultClientError::ConnectionFailure(format!("{}: {e}", endpoint.display()))
        })?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn round_trip(&mut self, line: &[u8]) -> Result<VaultResponse> {
        let io_err = |e: std::io::Error| VaultClientError::ConnectionFailure(e.to_string());

        self.writer.write_all(line).await.map_err(io_err)?;
        self.writer.flush().await.map_err(io_err)?;

        let mut buf = Zeroizing::new(Vec::new());
        let n = (&mut self.reader)
            .take(MAX_RESPONSE_SIZE + 1)
            .read_until(b'\n', &mut buf)
            .await
            .map_err(io_err)?;
        if n == 0 {
            return Err(VaultClientError::ConnectionFailure(
                "vault closed the connection".into(),
            ));
        }
        if buf.last() != Some(&b'\n') {
            return Err(VaultClientError::ProtocolError(format!(
                "unterminated response line ({n} bytes)"
            )));
        }
        serde_json::from_slice(&buf).map_err(|e| VaultClientError::ProtocolError(e.to_string()))
    }
}

/// One connection shared by all callers. Each exchange takes the connection
/// out of its slot and only puts it back after a clean round trip, so an
/// interrupted exchange leaves the slot empty and the next call reconnects.
pub struct VaultClient {
    endpoint: PathBuf,
    config: VaultClientConfig,
    conn: Mutex<Option<Conn>>,
}

impl VaultClient {
    /// Client that connects on first use.
    pub fn new(endpoint: impl Into<PathBuf>, config: VaultClientConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            conn: Mutex::new(None),
        }
    }

    /// Client with an established connection.
    pub async fn connect(endpoint: impl Into<PathBuf>, config: VaultClientConfig) -> Result<Self> {
        let client = Self::new(endpoint, config);
        let conn = tokio::time::timeout(client.config.io_timeout, Conn::open(&client.endpoint))
            .await
            .map_err(|_| VaultClientError::Timeout(client.config.io_timeout))??;
        *client.conn.lock().await = Some(conn);
        Ok(client)
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub async fn ping(&self) -> Result<()> {
        match self.call(&VaultRequest::Ping).await? {
            VaultResponse::Pong => Ok(()),
            other => Err(unexpected(&other, "Pong")),
        }
    }

    pub async fn store_key(
        &self,
        key_id: &str,
        key: &SecureBuffer,
        metadata: &HashMap<String, String>,
        expires_at: Option<i64>,
    ) -> Result<()> {
        let req = VaultRequest::StoreKey {
            key_id: key_id.to_string(),
            key_data: Zeroizing::new(key.expose().to_vec()),
            metadata: metadata.clone(),
            expires_at,
        };
        match self.call(&req).await? {
            VaultResponse::Success => Ok(()),
            other => Err(remote_or_unexpected(other, key_id, "Success")),
        }
    }

    pub async fn retrieve_key(&self, key_id: &str) -> Result<RetrievedKey> {
        let req = VaultRequest::RetrieveKey {
            key_id: key_id.to_string(),
        };
        match self.call(&req).await? {
            VaultResponse::KeyData {
                key_data,
                metadata,
                created_at,
                expires_at,
            } => Ok(RetrievedKey {
                key: SecureBuffer::from_zeroizing(key_data),
                metadata,
                created_at,
                expires_at,
            }),
            other => Err(remote_or_unexpected(other, key_id, "KeyData")),
        }
    }

    pub async fn delete_key(&self, key_id: &str) -> Result<()> {
        let req = VaultRequest::DeleteKey {
            key_id: key_id.to_string(),
        };
        match self.call(&req).await? {
            VaultResponse::Success => Ok(()),
            other => Err(remote_or_unexpected(other, key_id, "Success")),
        }
    }

    pub async fn key_exists(&self, key_id: &str) -> Result<bool> {
        let req = VaultRequest::KeyExists {
            key_id: key_id.to_string(),
        };
        match self.call(&req).await? {
            VaultResponse::Exists(found) => Ok(found),
            other => Err(remote_or_unexpected(other, key_id, "Exists")),
        }
    }

    /// May be empty on back-ends that cannot enumerate.
    pub async fn list_keys(&self) -> Result<Vec<String>> {
        match self.call(&VaultRequest::ListKeys).await? {
            VaultResponse::KeyList(ids) => Ok(ids),
            other => Err(remote_or_unexpected(other, "", "KeyList")),
        }
    }

    async fn call(&self, req: &VaultRequest) -> Result<VaultResponse> {
        let mut line = Zeroizing::new(
            serde_json::to_vec(req).map_err(|e| VaultClientError::ProtocolError(e.to_string()))?,
        );
        line.push(b'\n');

        let budget = self.config.call_timeout;
        match tokio::time::timeout(budget, self.call_with_retry(req.kind(), &line)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(request = req.kind(), "Vault call exceeded {:?}", budget);
                Err(VaultClientError::Timeout(budget))
            }
        }
    }

    async fn call_with_retry(&self, kind: &str, line: &[u8]) -> Result<VaultResponse> {
        let mut attempt = 0;
        loop {
            match self.exchange(line).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.backoff(attempt);
                    warn!(
                        request = kind,
                        attempt = attempt + 1,
                        error = %e,
                        "Vault exchange failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn exchange(&self, line: &[u8]) -> Result<VaultResponse> {
        let io_timeout = self.config.io_timeout;
        let mut slot = self.conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => {
                debug!(endpoint = %self.endpoint.display(), "Connecting to vault");
                tokio::time::timeout(io_timeout, Conn::open(&self.endpoint))
                    .await
                    .map_err(|_| VaultClientError::Timeout(io_timeout))??
            }
        };

        let resp = tokio::time::timeout(io_timeout, conn.round_trip(line))
            .await
            .map_err(|_| VaultClientError::Timeout(io_timeout))??;
        *slot = Some(conn);
        Ok(resp)
    }

    /// Exponential backoff capped at `max_backoff`, with the upper half
    /// randomized.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.config.max_backoff);
        let half = base / 2;
        let jitter_ms = rand::rng().random_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter_ms)
    }
}

fn unexpected(resp: &VaultResponse, expected: &str) -> VaultClientError {
    VaultClientError::ProtocolError(format!("expected {expected}, got {}", resp.kind()))
}

fn remote_or_unexpected(resp: VaultResponse, key_id: &str, expected: &str) -> VaultClientError {
    match resp {
        VaultResponse::Error(msg) => match ErrorCode::parse(&msg) {
            (Some(ErrorCode::NotFound), _) => VaultClientError::NotFound(key_id.to_string()),
            _ => VaultClientError::RemoteError(msg),
        },
        other => unexpected(&other, expected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(config: VaultClientConfig) -> VaultClient {
        VaultClient::new("/nonexistent/memvault/vault.sock", config)
    }

    #[test]
    fn test_backoff_is_capped_and_jittered() {
        let c = client(VaultClientConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
            ..Default::default()
        });
        for _ in 0..50 {
            let d0 = c.backoff(0);
            assert!(d0 >= Duration::from_millis(50) && d0 <= Duration::from_millis(100));
            let d5 = c.backoff(5);
            assert!(d5 >= Duration::from_millis(200) && d5 <= Duration::from_millis(400));
        }
        // Overflow-safe for silly attempt counts
        assert!(c.backoff(200) <= Duration::from_millis(400));
    }

    #[test]
    fn test_remote_error_mapping() {
        let err = remote_or_unexpected(
            VaultResponse::Error("not_found: key not found: k1".into()),
            "k1",
            "KeyData",
        );
        assert!(matches!(err, VaultClientError::NotFound(ref id) if id == "k1"));

        let err = remote_or_unexpected(
            VaultResponse::Error("storage_failure: keychain locked".into()),
            "k1",
            "KeyData",
        );
        assert!(matches!(err, VaultClientError::RemoteError(ref m) if m.contains("keychain locked")));

        let err = remote_or_unexpected(VaultResponse::Pong, "k1", "KeyData");
        assert!(matches!(err, VaultClientError::ProtocolError(_)));
    }

    #[test]
    fn test_retryable() {
        assert!(VaultClientError::ConnectionFailure("x".into()).is_retryable());
        assert!(VaultClientError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!VaultClientError::ProtocolError("x".into()).is_retryable());
        assert!(!VaultClientError::NotFound("k".into()).is_retryable());
        assert!(!VaultClientError::RemoteError("x".into()).is_retryable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_socket_is_connection_failure() {
        let c = client(VaultClientConfig {
            max_retries: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            ..Default::default()
        });
        let err = c.ping().await.unwrap_err();
        assert!(matches!(err, VaultClientError::ConnectionFailure(_)), "{err:?}");
    }
}
