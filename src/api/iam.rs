//! IAM endpoints: sign-in, token refresh, user profile

use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::api::http::RestClient;
use crate::auth::token::TokenPair;
use crate::errors::{Error, Result};

/// Temperature unit configured on the user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureUnit {
    Celsius,
    Fahrenheit,
}

/// User profile returned by who-am-i.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: i64,
    pub family_id: i64,
    pub email: String,
    pub settings: UserSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    pub temperature_unit: String,
}

impl UserProfile {
    pub fn temperature_unit(&self) -> TemperatureUnit {
        if self.settings.temperature_unit == "degC" {
            TemperatureUnit::Celsius
        } else {
            TemperatureUnit::Fahrenheit
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthenticationResponse {
    token: String,
    refresh_token: String,
}

/// Sign in with account credentials. HTTP 401 maps to `AuthenticationFailed`.
pub async fn perform_login(rest: &RestClient, email: &str, password: &str) -> Result<TokenPair> {
    let response = rest
        .request(
            Method::POST,
            "/iam/auth/sign-in",
            None,
            &[],
            Some(&json!({ "email": email, "password": password })),
            &[200, 401],
        )
        .await?;

    if response.status == 401 {
        return Err(Error::AuthenticationFailed(
            "sign-in rejected (invalid credentials)".to_string(),
        ));
    }

    let body: AuthenticationResponse = response.json()?;
    TokenPair::from_raw(body.token, body.refresh_token)
}

/// Exchange a refresh token for a new token pair. The refresh token rides in
/// the Authorization header, flagged by `isRefreshToken`.
pub async fn refresh_token(rest: &RestClient, refresh: &str) -> Result<TokenPair> {
    debug!("Exchanging refresh token");
    let response = rest
        .request::<()>(
            Method::POST,
            "/iam/auth/refresh-token",
            Some(refresh),
            &[("isRefreshToken", "true")],
            None,
            &[200],
        )
        .await?;

    let body: AuthenticationResponse = response.json()?;
    TokenPair::from_raw(body.token, body.refresh_token)
}

/// Fetch the authenticated user's profile.
pub async fn fetch_profile(rest: &RestClient, token: &str) -> Result<UserProfile> {
    let response = rest
        .request::<()>(
            Method::GET,
            "/iam/user/v2/who-am-i",
            Some(token),
            &[],
            None,
            &[200],
        )
        .await?;

    response.json()
}
