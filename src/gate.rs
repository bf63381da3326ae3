use axum::{
    extract::{Request, State},
    http::{StatusCode, header::LOCATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use reqwest::Url;
use tracing::debug;

use crate::server::{ApiError, AppState};

pub const LOGIN_PATH: &str = "/api/auth/signin";
const AUTH_PREFIX: &str = "/api/auth";
const API_PREFIX: &str = "/api";

#[derive(Debug, PartialEq, Eq)]
pub enum GateDecision {
    Pass,
    /// Send the browser to the login entry point.
    Redirect(String),
    /// API callers get a 401 instead of an HTML redirect.
    Reject,
}

pub fn decide(path: &str, authenticated: bool, base_url: &str) -> GateDecision {
    if authenticated || is_public(path) {
        GateDecision::Pass
    } else if is_under(path, API_PREFIX) {
        GateDecision::Reject
    } else {
        GateDecision::Redirect(login_redirect(base_url, path))
    }
}

pub fn is_public(path: &str) -> bool {
    path == "/" || is_under(path, AUTH_PREFIX)
}

pub fn login_redirect(base_url: &str, callback_path: &str) -> String {
    match Url::parse(base_url).and_then(|base| base.join(LOGIN_PATH)) {
        Ok(mut url) => {
            url.query_pairs_mut()
                .append_pair("callbackUrl", callback_path);
            url.to_string()
        }
        Err(_) => LOGIN_PATH.to_owned(),
    }
}

fn is_under(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Resolves the caller's session once per request and either forwards the
/// request with its `SessionContext` attached or answers for it.
pub async fn session_gate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let context = state
        .sessions
        .context_from_headers(request.headers(), Utc::now());
    let path = request.uri().path().to_owned();

    match decide(&path, context.is_authenticated(), state.config.origin()) {
        GateDecision::Pass => {
            request.extensions_mut().insert(context);
            next.run(request).await
        }
        GateDecision::Redirect(location) => {
            debug!(path = %path, "redirecting unauthenticated request to login");
            (StatusCode::FOUND, [(LOCATION, location)]).into_response()
        }
        GateDecision::Reject => {
            debug!(path = %path, "rejecting unauthenticated API request");
            ApiError::Unauthenticated.into_response()
        }
    }
}
