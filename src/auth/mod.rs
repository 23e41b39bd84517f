use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::AuthConfig;
use crate::error::AuthError;

/// A stable identity for an authenticated user (their email).
pub type UserId = String;

/// Validates connection credentials. Checked on every WebSocket connect and
/// on every privileged HTTP request.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn validate(&self, cookie: &str) -> Result<UserId, AuthError>;
}

/// Production provider: forwards the client's cookie to the external auth
/// service's `/me` endpoint. 200 with an identity means authenticated;
/// anything else is Unauthorized.
pub struct HttpAuthProvider {
    client: reqwest::Client,
    me_url: String,
}

#[derive(Deserialize)]
struct MeResponse {
    email: String,
}

impl HttpAuthProvider {
    pub fn new(config: &AuthConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            me_url: format!("{}/me", config.base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl AuthProvider for HttpAuthProvider {
    async fn validate(&self, cookie: &str) -> Result<UserId, AuthError> {
        if cookie.is_empty() {
            return Err(AuthError::Unauthorized);
        }

        let resp = self
            .client
            .get(&self.me_url)
            .header(reqwest::header::COOKIE, cookie)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Auth service request failed");
                AuthError::Unavailable(e.to_string())
            })?;

        if !resp.status().is_success() {
            return Err(AuthError::Unauthorized);
        }

        let me: MeResponse = resp.json().await.map_err(|e| {
            tracing::warn!(error = %e, "Auth service returned unparseable identity");
            AuthError::Unavailable(e.to_string())
        })?;

        Ok(me.email)
    }
}

/// Fixed cookie-to-user mapping for tests.
#[cfg(test)]
pub struct StaticAuthProvider {
    users: std::collections::HashMap<String, UserId>,
}

#[cfg(test)]
impl StaticAuthProvider {
    pub fn new(entries: &[(&str, &str)]) -> Self {
        Self {
            users: entries
                .iter()
                .map(|(cookie, user)| (cookie.to_string(), user.to_string()))
                .collect(),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn validate(&self, cookie: &str) -> Result<UserId, AuthError> {
        self.users
            .get(cookie)
            .cloned()
            .ok_or(AuthError::Unauthorized)
    }
}
