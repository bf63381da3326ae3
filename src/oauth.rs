use std::fmt;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url, header::ACCEPT};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    config::AppConfig,
    domain::{Credential, Viewer},
    tracker::{FetchError, TrackerClient, truncate_for_log},
};

/// Authorization-code grant against the Linear OAuth endpoints.
#[derive(Clone)]
pub struct OAuthClient {
    client_id: String,
    client_secret: String,
    authorize_url: String,
    token_url: String,
    redirect_uri: String,
    scope: String,
    client: Client,
}

impl fmt::Debug for OAuthClient {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("OAuthClient")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .field("redirect_uri", &self.redirect_uri)
            .field("scope", &self.scope)
            .finish()
    }
}

#[derive(Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TokenGrant")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

impl OAuthClient {
    pub fn from_config(config: &AppConfig, client: Client) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            authorize_url: config.authorize_url.clone(),
            token_url: config.token_url.clone(),
            redirect_uri: config.redirect_uri(),
            scope: config.scope.clone(),
            client,
        }
    }

    pub fn authorize_url(&self, state: &str) -> Result<Url, OAuthError> {
        let mut url = Url::parse(&self.authorize_url)
            .map_err(|err| OAuthError::InvalidEndpoint(err.to_string()))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.scope)
            .append_pair("state", state);
        Ok(url)
    }

    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant, OAuthError> {
        if code.trim().is_empty() {
            return Err(OAuthError::MissingCode);
        }

        let response = self
            .client
            .post(&self.token_url)
            .header(ACCEPT, "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body = truncate_for_log(&body);
            warn!(
                endpoint = %self.token_url,
                status = status.as_u16(),
                body = %body,
                "token exchange rejected"
            );
            return Err(OAuthError::TokenEndpoint { status, body });
        }

        let grant: TokenGrant = response.json().await?;
        if grant.access_token.trim().is_empty() {
            return Err(OAuthError::MissingAccessToken);
        }
        Ok(grant)
    }

    /// Exchanges `code` and confirms the resulting token by looking up the
    /// viewer. Any failure aborts the login.
    pub async fn sign_in(
        &self,
        tracker: &TrackerClient,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<(Credential, Viewer), OAuthError> {
        let grant = self.exchange_code(code).await?;
        let viewer = tracker.fetch_viewer(&grant.access_token).await?;
        info!(viewer = %viewer.id, "signed in with Linear");
        Ok((
            Credential {
                bearer_token: grant.access_token,
                issued_at: now,
            },
            viewer,
        ))
    }
}

/// Post-login redirect target. Root-relative paths and same-origin absolute
/// URLs are honored; anything else lands on the base URL.
pub fn resolve_redirect(target: &str, base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if target.starts_with('/') {
        return format!("{base}{target}");
    }
    match (Url::parse(target), Url::parse(base)) {
        (Ok(target_url), Ok(base_url)) if target_url.origin() == base_url.origin() => {
            target.to_owned()
        }
        _ => base.to_owned(),
    }
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("OAuth endpoint is not a valid URL: {0}")]
    InvalidEndpoint(String),
    #[error("authorization code is missing")]
    MissingCode,
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint { status: StatusCode, body: String },
    #[error("token response did not include an access token")]
    MissingAccessToken,
    #[error("failed to fetch user info: {0}")]
    Viewer(#[from] FetchError),
}
