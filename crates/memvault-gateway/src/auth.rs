// crates/memvault-gateway/src/auth.rs
// Bearer-token validation delegated to an external identity provider

use crate::config::{AuthConfig, IntrospectionStyle};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Scope value that grants admin rights regardless of role
pub const ADMIN_SCOPE: &str = "memvault:admin";

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub role: Option<String>,
    pub admin: bool,
}

/// Who is calling. `None` when authentication is disabled.
#[derive(Debug, Clone, Default)]
pub struct Caller(pub Option<Principal>);

impl Caller {
    pub fn principal(&self) -> Option<&Principal> {
        self.0.as_ref()
    }

    /// Owner filter for reads: admins and auth-disabled mode see every record.
    pub fn owner_filter(&self) -> Option<String> {
        match &self.0 {
            Some(p) if !p.admin => Some(p.subject.clone()),
            _ => None,
        }
    }

    pub fn is_admin(&self) -> bool {
        match &self.0 {
            Some(p) => p.admin,
            None => true,
        }
    }
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// `Unauthenticated` for a token the provider rejects.
    async fn validate(&self, token: &str) -> Result<Principal>;
}

/// Build the validator for `config`; `None` when auth is disabled.
pub fn from_config(config: &AuthConfig, http: reqwest::Client) -> Option<Arc<dyn TokenValidator>> {
    let url = config.introspection_url.clone()?;
    Some(Arc::new(IntrospectionValidator {
        http,
        url,
        style: config.style,
        client_id: config.client_id.clone(),
        client_secret: config.client_secret.clone(),
        admin_role: config.admin_role.clone(),
    }))
}

/// `Authorization: Bearer <token>`, scheme case-insensitive.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    #[serde(default)]
    active: bool,
    sub: Option<String>,
    role: Option<String>,
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserinfoResponse {
    id: Option<String>,
    sub: Option<String>,
    role: Option<String>,
}

pub struct IntrospectionValidator {
    http: reqwest::Client,
    url: String,
    style: IntrospectionStyle,
    client_id: Option<String>,
    client_secret: Option<String>,
    admin_role: String,
}

impl IntrospectionValidator {
    fn principal(&self, subject: Option<String>, role: Option<String>, scope: Option<&str>) -> Result<Principal> {
        let subject = subject
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::Unauthenticated("token has no subject".into()))?;
        let admin = role.as_deref() == Some(self.admin_role.as_str())
            || scope.is_some_and(|s| s.split_whitespace().any(|s| s == ADMIN_SCOPE));
        Ok(Principal {
            subject,
            role,
            admin,
        })
    }

    async fn introspect(&self, token: &str) -> Result<Principal> {
        let mut req = self
            .http
            .post(&self.url)
            .timeout(crate::http::FAST_TIMEOUT)
            .form(&[("token", token), ("token_type_hint", "access_token")]);
        if let Some(id) = &self.client_id {
            req = req.basic_auth(id, self.client_secret.as_deref());
        }

        let resp = req.send().await.map_err(provider_unreachable)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(provider_status(status));
        }
        let body: IntrospectionResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Internal(format!("introspection response: {e}")))?;
        if !body.active {
            return Err(GatewayError::Unauthenticated("token is not active".into()));
        }
        self.principal(body.sub, body.role, body.scope.as_deref())
    }

    async fn userinfo(&self, token: &str) -> Result<Principal> {
        let mut req = self
            .http
            .get(&self.url)
            .timeout(crate::http::FAST_TIMEOUT)
            .bearer_auth(token);
        if let Some(key) = &self.client_secret {
            req = req.header("apikey", key);
        }

        let resp = req.send().await.map_err(provider_unreachable)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(provider_status(status));
        }
        let body: UserinfoResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Internal(format!("userinfo response: {e}")))?;
        self.principal(body.id.or(body.sub), body.role, None)
    }
}

fn provider_unreachable(err: reqwest::Error) -> GatewayError {
    warn!(error = %err, "Identity provider unreachable");
    GatewayError::Internal(format!("identity provider unreachable: {err}"))
}

fn provider_status(status: reqwest::StatusCode) -> GatewayError {
    if status.is_client_error() {
        GatewayError::Unauthenticated(format!("identity provider rejected token ({status})"))
    } else {
        GatewayError::Internal(format!("identity provider returned {status}"))
    }
}

#[async_trait]
impl TokenValidator for IntrospectionValidator {
    async fn validate(&self, token: &str) -> Result<Principal> {
        let principal = match self.style {
            IntrospectionStyle::Rfc7662 => self.introspect(token).await?,
            IntrospectionStyle::Userinfo => self.userinfo(token).await?,
        };
        debug!(subject = %principal.subject, admin = principal.admin, "Token validated");
        Ok(principal)
    }
}
