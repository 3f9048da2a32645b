// crates/memvault-gateway/src/config/file.rs
// File-based configuration from ~/.memvault/gateway.toml

use memvault_vault::config::ConfigValidation;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Top-level config structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub vault: VaultSection,
    pub embeddings: EmbeddingsConfig,
    pub auth: AuthConfig,
    pub limits: Limits,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub request_timeout_secs: u64,
    /// Ceiling for a caller-supplied `x-request-timeout-ms`
    pub max_request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:50051".into(),
            request_timeout_secs: 30,
            max_request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: memvault_dir().join("memories.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VaultSection {
    /// Daemon socket; the daemon's default endpoint when unset
    pub socket: Option<PathBuf>,
    pub io_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for VaultSection {
    fn default() -> Self {
        Self {
            socket: None,
            io_timeout_ms: 2000,
            call_timeout_ms: 5000,
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
        }
    }
}

impl VaultSection {
    pub fn client_config(&self) -> crate::vault_client::VaultClientConfig {
        crate::vault_client::VaultClientConfig {
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn endpoint(&self) -> PathBuf {
        self.socket
            .clone()
            .unwrap_or_else(memvault_vault::ipc::default_endpoint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Local feature hashing, no network
    #[default]
    Hash,
    /// OpenAI-compatible `/embeddings` endpoint
    OpenAi,
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hash" => Ok(Self::Hash),
            "openai" => Ok(Self::OpenAi),
            other => Err(format!("unknown embeddings provider '{other}' (hash|openai)")),
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub provider: EmbeddingProvider,
    pub dimensions: usize,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hash,
            dimensions: 384,
            base_url: "https://api.openai.com/v1".into(),
            model: "text-embedding-3-small".into(),
            api_key: None,
        }
    }
}

impl fmt::Debug for EmbeddingsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingsConfig")
            .field("provider", &self.provider)
            .field("dimensions", &self.dimensions)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IntrospectionStyle {
    /// RFC 7662 token introspection
    #[default]
    Rfc7662,
    /// Bearer-authenticated user lookup
    Userinfo,
}

impl std::str::FromStr for IntrospectionStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rfc7662" => Ok(Self::Rfc7662),
            "userinfo" => Ok(Self::Userinfo),
            other => Err(format!("unknown auth style '{other}' (rfc7662|userinfo)")),
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Auth is disabled when unset
    pub introspection_url: Option<String>,
    pub style: IntrospectionStyle,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub admin_role: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            introspection_url: None,
            style: IntrospectionStyle::Rfc7662,
            client_id: None,
            client_secret: None,
            admin_role: "admin".into(),
        }
    }
}

impl AuthConfig {
    pub fn enabled(&self) -> bool {
        self.introspection_url.is_some()
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("introspection_url", &self.introspection_url)
            .field("style", &self.style)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("admin_role", &self.admin_role)
            .finish()
    }
}

/// Request size and count bounds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_content_bytes: usize,
    pub max_tags: usize,
    pub max_metadata_entries: usize,
    pub max_results: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_content_bytes: 10 * 1024 * 1024,
            max_tags: 50,
            max_metadata_entries: 100,
            max_results: 1000,
        }
    }
}

impl GatewayConfig {
    /// Load from `path`, else ~/.memvault/gateway.toml. A missing or broken
    /// file falls back to defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::config_path);

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    debug!(path = %path.display(), "Loaded config from file");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse config file");
                    Self::default()
                }
            },
            Err(_) => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
        }
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        memvault_dir().join("gateway.toml")
    }

    pub fn validate(&self) -> ConfigValidation {
        let mut v = ConfigValidation::new();

        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            v.add_error(format!("server.bind '{}' is not a socket address", self.server.bind));
        }
        if self.server.request_timeout_secs == 0 {
            v.add_error("server.request_timeout_secs must be at least 1");
        }
        if self.server.max_request_timeout_secs < self.server.request_timeout_secs {
            v.add_warning("server.max_request_timeout_secs is below request_timeout_secs");
        }

        if self.vault.io_timeout_ms == 0 || self.vault.call_timeout_ms == 0 {
            v.add_error("vault timeouts must be non-zero");
        }
        if self.vault.call_timeout_ms < self.vault.io_timeout_ms {
            v.add_warning("vault.call_timeout_ms is below io_timeout_ms; retries will never run");
        }

        if self.embeddings.dimensions == 0 {
            v.add_error("embeddings.dimensions must be positive");
        }
        if self.embeddings.provider == EmbeddingProvider::OpenAi
            && self.embeddings.api_key.is_none()
        {
            v.add_error("embeddings.provider = openai requires an api key (MEMVAULT_EMBEDDINGS_API_KEY)");
        }

        match &self.auth.introspection_url {
            None => v.add_warning("auth.introspection_url not set, authentication is DISABLED"),
            Some(url) => {
                if !url.starts_with("https://") && !url.starts_with("http://") {
                    v.add_error(format!("auth.introspection_url '{url}' is not an http(s) URL"));
                } else if url.starts_with("http://") {
                    v.add_warning("auth.introspection_url is plain http");
                }
                if self.auth.style == IntrospectionStyle::Rfc7662
                    && (self.auth.client_id.is_none() || self.auth.client_secret.is_none())
                {
                    v.add_warning("rfc7662 introspection without client credentials");
                }
            }
        }

        let l = &self.limits;
        if l.max_content_bytes == 0 || l.max_results == 0 {
            v.add_error("limits.max_content_bytes and limits.max_results must be positive");
        }

        v
    }
}

fn memvault_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".memvault")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "0.0.0.0:6000"

[vault]
socket = "/run/memvault/vault.sock"
max_retries = 5

[embeddings]
provider = "openai"
dimensions = 1536
api_key = "sk-test"

[auth]
introspection_url = "https://id.example.com/introspect"
style = "userinfo"

[limits]
max_tags = 10
"#;
        let config: GatewayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:6000");
        assert_eq!(config.server.request_timeout_secs, 30);
        assert_eq!(config.vault.endpoint(), PathBuf::from("/run/memvault/vault.sock"));
        assert_eq!(config.vault.max_retries, 5);
        assert_eq!(config.vault.io_timeout_ms, 2000);
        assert_eq!(config.embeddings.provider, EmbeddingProvider::OpenAi);
        assert_eq!(config.embeddings.dimensions, 1536);
        assert_eq!(config.auth.style, IntrospectionStyle::Userinfo);
        assert!(config.auth.enabled());
        assert_eq!(config.limits.max_tags, 10);
        assert_eq!(config.limits.max_results, 1000);
    }

    #[test]
    fn test_parse_empty_config() {
        let config: GatewayConfig = toml::from_str("").unwrap();
        assert_eq!(config.embeddings.dimensions, 384);
        assert_eq!(config.limits.max_content_bytes, 10 * 1024 * 1024);
        assert!(!config.auth.enabled());
        assert!(config.validate().is_valid());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = GatewayConfig::default();
        config.embeddings.api_key = Some("sk-very-secret".into());
        config.auth.client_secret = Some("hunter2".into());
        let dump = format!("{config:?}");
        assert!(!dump.contains("sk-very-secret"));
        assert!(!dump.contains("hunter2"));
        assert!(dump.contains("[REDACTED]"));
    }

    #[test]
    fn test_validate() {
        let mut config = GatewayConfig::default();
        let v = config.validate();
        assert!(v.is_valid());
        assert!(v.warnings.iter().any(|w| w.contains("DISABLED")));

        config.server.bind = "not an address".into();
        config.embeddings.provider = EmbeddingProvider::OpenAi;
        config.auth.introspection_url = Some("ftp://id.example.com".into());
        let v = config.validate();
        assert_eq!(v.errors.len(), 3, "{:?}", v.errors);
    }

    #[test]
    fn test_provider_from_str() {
        assert_eq!("OpenAI".parse::<EmbeddingProvider>(), Ok(EmbeddingProvider::OpenAi));
        assert_eq!("hash".parse::<EmbeddingProvider>(), Ok(EmbeddingProvider::Hash));
        assert!("gemini".parse::<EmbeddingProvider>().is_err());
        assert_eq!("userinfo".parse::<IntrospectionStyle>(), Ok(IntrospectionStyle::Userinfo));
    }
}
