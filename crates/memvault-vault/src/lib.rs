// crates/memvault-vault/src/lib.rs
// memvault-vault - OS secret stores behind a local IPC socket

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod error;
pub mod ipc;
pub mod keystore;
pub mod protocol;
pub mod secure;

pub use error::{Result, VaultError};
pub use secure::SecureBuffer;
