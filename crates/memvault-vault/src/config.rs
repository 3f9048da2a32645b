// crates/memvault-vault/src/config.rs
// Daemon configuration: ~/.memvault/vault.toml, then MEMVAULT_VAULT_* env, then CLI

use crate::keystore::BackendKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_SERVICE_NAME: &str = "memvault-vault";
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Vault daemon settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Unix socket path; platform default when unset
    pub socket: Option<PathBuf>,
    pub backend: BackendKind,
    /// Service name the key entries are filed under in the OS store
    pub service_name: String,
    pub max_connections: usize,
    pub request_timeout_secs: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            socket: None,
            backend: BackendKind::Native,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl VaultConfig {
    /// Load from `path` (or ~/.memvault/vault.toml), falling back to
    /// defaults when the file is missing or unparsable, then apply env.
    pub fn load(path: Option<&Path>) -> Self {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);

        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    debug!(path = %path.display(), "Loaded vault config from file");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse vault config file");
                    Self::default()
                }
            },
            Err(_) => {
                debug!(path = %path.display(), "Vault config file not found, using defaults");
                Self::default()
            }
        };
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Some(socket) = read_env("MEMVAULT_VAULT_SOCKET") {
            self.socket = Some(PathBuf::from(socket));
        }
        if let Some(backend) = read_env("MEMVAULT_VAULT_BACKEND") {
            match backend.parse() {
                Ok(kind) => self.backend = kind,
                Err(e) => warn!(error = %e, "Ignoring MEMVAULT_VAULT_BACKEND"),
            }
        }
        if let Some(service) = read_env("MEMVAULT_VAULT_SERVICE") {
            self.service_name = service;
        }
    }

    pub fn validate(&self) -> ConfigValidation {
        let mut validation = ConfigValidation::new();

        if self.service_name.trim().is_empty() {
            validation.add_error("service_name must not be empty");
        }
        if self.max_connections == 0 {
            validation.add_error("max_connections must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            validation.add_error("request_timeout_secs must be at least 1");
        }
        if self.backend == BackendKind::Memory {
            validation.add_warning("backend = \"memory\": keys do not survive a daemon restart");
        }

        validation
    }
}

/// Default config file location
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".memvault")
        .join("vault.toml")
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Result of validating a config
#[derive(Debug, Default)]
pub struct ConfigValidation {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Human-readable report
    pub fn report(&self) -> String {
        let mut lines = Vec::new();
        if !self.errors.is_empty() {
            lines.push("Errors:".to_string());
            lines.extend(self.errors.iter().map(|e| format!("  - {e}")));
        }
        if !self.warnings.is_empty() {
            lines.push("Warnings:".to_string());
            lines.extend(self.warnings.iter().map(|w| format!("  - {w}")));
        }
        if lines.is_empty() {
            "Configuration OK".to_string()
        } else {
            lines.join("\n")
        }
    }

    /// Log warnings; turn errors into one failure.
    pub fn into_result(self) -> Result<(), String> {
        for w in &self.warnings {
            warn!("{w}");
        }
        if self.is_valid() {
            Ok(())
        } else {
            Err(self.errors.join("; "))
        }
    }
}
