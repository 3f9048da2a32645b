// crates/memvault-gateway/src/config/mod.rs
// Gateway configuration: TOML file, then environment, then CLI flags

pub mod env;
pub mod file;

pub use file::{
    AuthConfig, DatabaseConfig, EmbeddingProvider, EmbeddingsConfig, GatewayConfig,
    IntrospectionStyle, Limits, ServerConfig, VaultSection,
};
pub use memvault_vault::config::ConfigValidation;
