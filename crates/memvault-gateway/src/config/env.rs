// crates/memvault-gateway/src/config/env.rs
// Environment overrides - single place where MEMVAULT_* variables are read

use super::file::GatewayConfig;
use std::path::PathBuf;
use tracing::{debug, warn};

pub const BIND: &str = "MEMVAULT_BIND";
pub const DB_PATH: &str = "MEMVAULT_DB_PATH";
pub const VAULT_SOCKET: &str = "MEMVAULT_VAULT_SOCKET";
pub const EMBEDDINGS_PROVIDER: &str = "MEMVAULT_EMBEDDINGS_PROVIDER";
pub const EMBEDDINGS_DIMENSIONS: &str = "MEMVAULT_EMBEDDINGS_DIMENSIONS";
pub const EMBEDDINGS_BASE_URL: &str = "MEMVAULT_EMBEDDINGS_BASE_URL";
pub const EMBEDDINGS_MODEL: &str = "MEMVAULT_EMBEDDINGS_MODEL";
pub const EMBEDDINGS_API_KEY: &str = "MEMVAULT_EMBEDDINGS_API_KEY";
pub const AUTH_URL: &str = "MEMVAULT_AUTH_INTROSPECTION_URL";
pub const AUTH_STYLE: &str = "MEMVAULT_AUTH_STYLE";
pub const AUTH_CLIENT_ID: &str = "MEMVAULT_AUTH_CLIENT_ID";
pub const AUTH_CLIENT_SECRET: &str = "MEMVAULT_AUTH_CLIENT_SECRET";

impl GatewayConfig {
    /// Overlay process environment variables.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Overlay variables from `lookup`; blank values count as unset.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(bind) = get(BIND) {
            self.server.bind = bind;
        }
        if let Some(path) = get(DB_PATH) {
            self.database.path = PathBuf::from(path);
        }
        if let Some(socket) = get(VAULT_SOCKET) {
            self.vault.socket = Some(PathBuf::from(socket));
        }

        if let Some(provider) = get(EMBEDDINGS_PROVIDER) {
            match provider.parse() {
                Ok(p) => self.embeddings.provider = p,
                Err(e) => warn!("{EMBEDDINGS_PROVIDER}: {e}"),
            }
        }
        if let Some(dims) = get(EMBEDDINGS_DIMENSIONS) {
            match dims.trim().parse() {
                Ok(d) => self.embeddings.dimensions = d,
                Err(_) => warn!("{EMBEDDINGS_DIMENSIONS}='{dims}' is not a number, ignoring"),
            }
        }
        if let Some(url) = get(EMBEDDINGS_BASE_URL) {
            self.embeddings.base_url = url;
        }
        if let Some(model) = get(EMBEDDINGS_MODEL) {
            self.embeddings.model = model;
        }
        if let Some(key) = get(EMBEDDINGS_API_KEY) {
            self.embeddings.api_key = Some(key);
        }

        if let Some(url) = get(AUTH_URL) {
            self.auth.introspection_url = Some(url);
        }
        if let Some(style) = get(AUTH_STYLE) {
            match style.parse() {
                Ok(s) => self.auth.style = s,
                Err(e) => warn!("{AUTH_STYLE}: {e}"),
            }
        }
        if let Some(id) = get(AUTH_CLIENT_ID) {
            self.auth.client_id = Some(id);
        }
        if let Some(secret) = get(AUTH_CLIENT_SECRET) {
            self.auth.client_secret = Some(secret);
        }

        debug!(
            embeddings_key = self.embeddings.api_key.is_some(),
            auth = self.auth.enabled(),
            "Environment overrides applied"
        );
    }
}
