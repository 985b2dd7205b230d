//! OAuth2 bootstrap for the tool channel.
//!
//! The viaNexus authorization server accepts the software-statement JWT as a
//! `jwt-bearer` assertion and returns a short-lived access token. The token
//! is cached and refreshed shortly before expiry.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{ChannelError, Result};

/// Supplies the bearer token attached to every tool-server request.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String>;
}

struct CachedToken {
    token: String,
    expires_at: i64,
}

/// Exchanges the software-statement JWT for an access token at the server's
/// token endpoint.
pub struct SoftwareStatementAuth {
    client: reqwest::Client,
    token_url: String,
    software_statement: String,
    cached: RwLock<Option<CachedToken>>,
}

impl SoftwareStatementAuth {
    /// `base_url` is the normalized server origin (scheme://host:port).
    pub fn new(base_url: &str, software_statement: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url: format!("{base_url}/oauth/token"),
            software_statement: software_statement.into(),
            cached: RwLock::new(None),
        }
    }

    async fn exchange(&self) -> Result<CachedToken> {
        info!("exchanging software statement for tool-server access token");

        let resp = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", &self.software_statement),
            ])
            .send()
            .await
            .map_err(|e| ChannelError::Auth(format!("token exchange request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Auth(format!(
                "token exchange failed ({status}): {body}"
            )));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ChannelError::Auth(format!("invalid token response: {e}")))?;

        debug!(expires_in = token.expires_in, "access token obtained");
        Ok(CachedToken {
            token: token.access_token,
            expires_at: chrono::Utc::now().timestamp() + token.expires_in as i64,
        })
    }
}

#[async_trait]
impl AccessTokenProvider for SoftwareStatementAuth {
    async fn bearer_token(&self) -> Result<String> {
        let now = chrono::Utc::now().timestamp();

        // Fast path
        {
            let cached = self.cached.read().await;
            if let Some(c) = cached.as_ref() {
                if now + 120 < c.expires_at {
                    return Ok(c.token.clone());
                }
            }
        }

        // Slow path — re-check under the write lock, then exchange
        let mut cached = self.cached.write().await;
        if let Some(c) = cached.as_ref() {
            if now + 120 < c.expires_at {
                return Ok(c.token.clone());
            }
        }

        let fresh = self.exchange().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }
}

/// Fixed token. For tests and pre-authorized deployments.
pub struct StaticTokenAuth(pub String);

#[async_trait]
impl AccessTokenProvider for StaticTokenAuth {
    async fn bearer_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}
