// crates/memvault-gateway/src/lib.rs
// memvault-gateway - encrypted memory store keyed by the vault daemon

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod api;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod http;
pub mod keys;
pub mod service;
pub mod vault_client;

pub use error::{GatewayError, Result};
pub use service::MemoryService;
pub use vault_client::{VaultClient, VaultClientError};
