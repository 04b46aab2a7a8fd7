//! Token manager for the AirCloud IAM service

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::http::RestClient;
use crate::api::iam;
use crate::auth::token::TokenPair;
use crate::errors::Result;

/// Supplies a valid bearer token on demand.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Get a token valid for at least the safety margin.
    async fn token(&self) -> Result<String>;
}

/// Holds the current access/refresh token pair and renews it before expiry.
///
/// All token reads go through one mutex so concurrent callers never trigger
/// duplicate logins.
pub struct AuthManager {
    rest: Arc<RestClient>,
    email: String,
    password: SecretString,
    refresh_margin: Duration,
    tokens: Mutex<Option<TokenPair>>,
}

impl AuthManager {
    pub fn new(rest: Arc<RestClient>, email: String, password: SecretString) -> Self {
        Self {
            rest,
            email,
            password,
            refresh_margin: Duration::minutes(1),
            tokens: Mutex::new(None),
        }
    }

    async fn login(&self, slot: &mut Option<TokenPair>) -> Result<String> {
        info!("Signing in as {}", self.email);
        let pair = iam::perform_login(&self.rest, &self.email, self.password.expose_secret()).await?;
        let value = pair.access.raw.clone();
        *slot = Some(pair);
        Ok(value)
    }
}

#[async_trait]
impl TokenSource for AuthManager {
    async fn token(&self) -> Result<String> {
        let mut tokens = self.tokens.lock().await;

        let Some(pair) = tokens.as_ref() else {
            return self.login(&mut tokens).await;
        };

        if pair.access.is_valid_for(self.refresh_margin) {
            return Ok(pair.access.raw.clone());
        }

        if pair.refresh.is_valid_for(self.refresh_margin) {
            debug!("Access token expiring, exchanging refresh token");
            match iam::refresh_token(&self.rest, &pair.refresh.raw).await {
                Ok(new_pair) => {
                    let value = new_pair.access.raw.clone();
                    *tokens = Some(new_pair);
                    return Ok(value);
                }
                Err(e) => {
                    warn!("Refresh token exchange failed, falling back to login: {}", e);
                }
            }
        }

        self.login(&mut tokens).await
    }
}
