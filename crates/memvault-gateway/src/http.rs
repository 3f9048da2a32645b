// crates/memvault-gateway/src/http.rs
// Shared HTTP client for outbound calls (token introspection, embeddings)

use std::time::Duration;

/// Default request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-request timeout for quick calls such as introspection and embeddings
pub const FAST_TIMEOUT: Duration = Duration::from_secs(30);

/// Create the shared HTTP client. Built once at startup and cloned into
/// whatever needs it; reqwest pools connections internally.
pub fn create_shared_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(10)
        .user_agent(concat!("memvault-gateway/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
