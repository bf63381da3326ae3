use std::{fmt, net::SocketAddr};

use chrono::Duration;
use clap::Parser;
use reqwest::Url;
use thiserror::Error;

pub const DEFAULT_AUTHORIZE_URL: &str = "https://linear.app/oauth/authorize";
pub const DEFAULT_TOKEN_URL: &str = "https://api.linear.app/oauth/token";
pub const DEFAULT_API_URL: &str = "https://api.linear.app/graphql";
pub const CALLBACK_PATH: &str = "/api/auth/callback/linear";

const MIN_SESSION_SECRET_LEN: usize = 32;

#[derive(Parser, Clone)]
#[command(name = "linear-timeline")]
#[command(about = "Serve a timeline view of Linear issues grouped by assignee")]
#[command(version)]
pub struct AppConfig {
    /// Address the HTTP server binds to
    #[arg(long, env = "TIMELINE_BIND", default_value = "127.0.0.1:3000")]
    pub bind: SocketAddr,

    /// Public origin of this application, used for redirects and cookies
    #[arg(long, env = "TIMELINE_BASE_URL", default_value = "http://localhost:3000")]
    pub base_url: String,

    /// OAuth client identifier registered with Linear
    #[arg(long, env = "LINEAR_CLIENT_ID")]
    pub client_id: String,

    /// OAuth client secret registered with Linear
    #[arg(long, env = "LINEAR_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: String,

    /// Key used to sign session cookies
    #[arg(long, env = "TIMELINE_SESSION_SECRET", hide_env_values = true)]
    pub session_secret: String,

    #[arg(long, env = "LINEAR_AUTHORIZE_URL", default_value = DEFAULT_AUTHORIZE_URL)]
    pub authorize_url: String,

    #[arg(long, env = "LINEAR_TOKEN_URL", default_value = DEFAULT_TOKEN_URL)]
    pub token_url: String,

    /// GraphQL endpoint, also used for the viewer lookup after login
    #[arg(long, env = "LINEAR_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    #[arg(long, env = "LINEAR_SCOPE", default_value = "read")]
    pub scope: String,

    /// Hours a session stays valid after sign-in
    #[arg(long, env = "TIMELINE_SESSION_TTL_HOURS", default_value_t = 720)]
    pub session_ttl_hours: u32,

    /// Show raw upstream error detail in the page banner
    #[arg(long, env = "TIMELINE_DEV")]
    pub dev: bool,

    /// Tracing filter directive, e.g. "info" or "linear_timeline=debug"
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind", &self.bind)
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("session_secret", &"<redacted>")
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .field("api_url", &self.api_url)
            .field("scope", &self.scope)
            .field("session_ttl_hours", &self.session_ttl_hours)
            .field("dev", &self.dev)
            .finish()
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Missing("client id"));
        }
        if self.client_secret.trim().is_empty() {
            return Err(ConfigError::Missing("client secret"));
        }
        if self.session_secret.len() < MIN_SESSION_SECRET_LEN {
            return Err(ConfigError::WeakSessionSecret(MIN_SESSION_SECRET_LEN));
        }
        if self.session_ttl_hours == 0 {
            return Err(ConfigError::ZeroSessionTtl);
        }
        for (name, value) in [
            ("base url", &self.base_url),
            ("authorize url", &self.authorize_url),
            ("token url", &self.token_url),
            ("api url", &self.api_url),
        ] {
            let url = Url::parse(value).map_err(|_| ConfigError::InvalidUrl {
                name,
                value: value.clone(),
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidUrl {
                    name,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    /// Base URL without a trailing slash, e.g. `https://timeline.example.com`.
    pub fn origin(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn redirect_uri(&self) -> String {
        format!("{}{CALLBACK_PATH}", self.origin())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::hours(i64::from(self.session_ttl_hours))
    }

    pub fn secure_cookies(&self) -> bool {
        self.base_url.starts_with("https://")
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("session secret must be at least {0} bytes long")]
    WeakSessionSecret(usize),
    #[error("session TTL must be greater than zero")]
    ZeroSessionTtl,
    #[error("{name} is not an absolute http(s) URL: {value}")]
    InvalidUrl { name: &'static str, value: String },
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        bind: "127.0.0.1:0".parse().expect("bind addr"),
        base_url: "http://localhost:3000".into(),
        client_id: "client-id".into(),
        client_secret: "client-secret".into(),
        session_secret: "0123456789abcdef0123456789abcdef".into(),
        authorize_url: DEFAULT_AUTHORIZE_URL.into(),
        token_url: DEFAULT_TOKEN_URL.into(),
        api_url: DEFAULT_API_URL.into(),
        scope: "read".into(),
        session_ttl_hours: 720,
        dev: false,
        log_level: "info".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_required_flags_and_defaults() {
        let config = AppConfig::try_parse_from([
            "linear-timeline",
            "--client-id",
            "abc",
            "--client-secret",
            "def",
            "--session-secret",
            "0123456789abcdef0123456789abcdef",
        ])
        .expect("parse");
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.session_ttl_hours, 720);
        assert!(!config.dev);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_short_session_secret() {
        let mut config = test_config();
        config.session_secret = "short".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WeakSessionSecret(_))
        ));
    }

    #[test]
    fn rejects_non_http_base_url() {
        let mut config = test_config();
        config.base_url = "ftp://example.com".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn redirect_uri_strips_trailing_slash() {
        let mut config = test_config();
        config.base_url = "https://timeline.example.com/".into();
        assert_eq!(
            config.redirect_uri(),
            "https://timeline.example.com/api/auth/callback/linear"
        );
        assert!(config.secure_cookies());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let rendered = format!("{:?}", test_config());
        assert!(!rendered.contains("client-secret"));
        assert!(!rendered.contains("0123456789abcdef"));
    }
}
