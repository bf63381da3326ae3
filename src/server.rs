use std::sync::Arc;

use anyhow::Context;
use axum::{
    Extension, Json, Router,
    extract::{Query, State},
    http::{
        StatusCode,
        header::{LOCATION, SET_COOKIE},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    config::{AppConfig, CALLBACK_PATH},
    domain::{Issue, User},
    gate,
    oauth::{OAuthClient, OAuthError, resolve_redirect},
    page,
    projection::{self, Projection},
    session::{SessionContext, SessionStore, expired_session_cookie},
    tracker::{self, FetchError, TrackerClient},
};

#[derive(Clone, Debug)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sessions: SessionStore,
    pub tracker: TrackerClient,
    pub oauth: OAuthClient,
}

impl AppState {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let http = tracker::build_client().context("failed to build HTTP client")?;
        let sessions = SessionStore::new(config.session_secret.as_bytes(), config.session_ttl())
            .context("failed to initialize session store")?;
        Ok(Self {
            tracker: TrackerClient::with_client(config.api_url.clone(), http.clone()),
            oauth: OAuthClient::from_config(&config, http),
            sessions,
            config: Arc::new(config),
        })
    }

    /// Maps a tracker failure for the API surface. A token the tracker no
    /// longer accepts ends the session.
    pub fn upstream_failure(
        &self,
        session: &SessionContext,
        context: &'static str,
        err: FetchError,
    ) -> ApiError {
        if err.is_token_rejected() {
            if let Some(session_id) = session.session_id() {
                self.sessions.destroy(session_id);
            }
            warn!("Linear rejected the session token; signing out");
            return ApiError::Unauthenticated;
        }
        match err {
            FetchError::Unauthenticated => ApiError::Unauthenticated,
            source => ApiError::Upstream { context, source },
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(page::home))
        .route("/timeline", get(page::home))
        .route(gate::LOGIN_PATH, get(sign_in))
        .route(CALLBACK_PATH, get(oauth_callback))
        .route("/api/auth/signout", post(sign_out))
        .route("/api/auth/session", get(session_info))
        .route("/api/issues", get(list_issues))
        .route("/api/users", get(list_users))
        .route("/api/timeline", get(timeline))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            gate::session_gate,
        ))
        .with_state(state)
}

// Query and response payloads ------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct TimelineQuery {
    pub assignee: Option<String>,
}

impl TimelineQuery {
    pub fn selected_assignee(&self) -> Option<&str> {
        self.assignee
            .as_deref()
            .map(str::trim)
            .filter(|assignee| !assignee.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct SignInQuery {
    #[serde(rename = "callbackUrl")]
    callback_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct IssuesResponse {
    issues: Vec<Issue>,
}

#[derive(Serialize)]
struct UsersResponse {
    users: Vec<User>,
}

#[derive(Serialize)]
struct TimelineResponse {
    #[serde(flatten)]
    projection: Projection,
    assignee: Option<String>,
}

#[derive(Serialize)]
struct SessionResponse {
    authenticated: bool,
    user: Option<SessionUser>,
}

#[derive(Serialize)]
struct SessionUser {
    id: String,
    name: String,
    email: Option<String>,
    image: Option<String>,
}

// Handlers ------------------------------------------------------------------

async fn list_issues(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> Result<Json<IssuesResponse>, ApiError> {
    let issues = state
        .tracker
        .fetch_issues(session.bearer_token(), Utc::now())
        .await
        .map_err(|err| {
            state.upstream_failure(&session, "Failed to fetch issues from Linear API", err)
        })?;
    Ok(Json(IssuesResponse { issues }))
}

async fn list_users(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> Result<Json<UsersResponse>, ApiError> {
    let users = state
        .tracker
        .fetch_users(session.bearer_token())
        .await
        .map_err(|err| {
            state.upstream_failure(&session, "Failed to fetch users from Linear API", err)
        })?;
    Ok(Json(UsersResponse { users }))
}

async fn timeline(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Query(query): Query<TimelineQuery>,
) -> Result<Json<TimelineResponse>, ApiError> {
    let now = Utc::now();
    let workspace = state
        .tracker
        .fetch_workspace(session.bearer_token(), now)
        .await
        .map_err(|err| {
            state.upstream_failure(&session, "Failed to load timeline from Linear API", err)
        })?;
    let selected = query.selected_assignee();
    let projection = projection::project(&workspace.issues, &workspace.users, selected, now);
    Ok(Json(TimelineResponse {
        projection,
        assignee: selected.map(str::to_owned),
    }))
}

async fn session_info(Extension(session): Extension<SessionContext>) -> Json<SessionResponse> {
    let user = session.viewer().map(|viewer| SessionUser {
        id: viewer.id.clone(),
        name: viewer.name.clone(),
        email: viewer.email.clone(),
        image: viewer.avatar_url.clone(),
    });
    Json(SessionResponse {
        authenticated: session.is_authenticated(),
        user,
    })
}

async fn sign_in(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Query(query): Query<SignInQuery>,
) -> Result<Response, ApiError> {
    let target = resolve_redirect(
        query.callback_url.as_deref().unwrap_or("/"),
        state.config.origin(),
    );
    if session.is_authenticated() {
        return Ok(found(&target));
    }

    let login_state = state.sessions.begin_login(target, Utc::now());
    let authorize_url = state.oauth.authorize_url(&login_state)?;
    Ok(found(authorize_url.as_str()))
}

async fn oauth_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    if let Some(error) = query.error.as_deref() {
        warn!(error = %error, "Linear declined the authorization request");
        return Err(ApiError::InvalidLogin("Sign-in was cancelled or denied"));
    }
    let now = Utc::now();
    let target = query
        .state
        .as_deref()
        .and_then(|login_state| state.sessions.complete_login(login_state, now))
        .ok_or(ApiError::InvalidLogin(
            "Sign-in request expired or is invalid",
        ))?;
    let code = query
        .code
        .as_deref()
        .ok_or(ApiError::InvalidLogin("Authorization code is missing"))?;

    let (credential, viewer) = state.oauth.sign_in(&state.tracker, code, now).await?;
    let session_id = state.sessions.create(credential, viewer, now);
    info!("session established");

    let cookie = state
        .sessions
        .session_cookie(&session_id, state.config.secure_cookies());
    Ok((
        StatusCode::FOUND,
        [(LOCATION, target), (SET_COOKIE, cookie)],
    )
        .into_response())
}

async fn sign_out(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> Response {
    if let Some(session_id) = session.session_id()
        && state.sessions.destroy(session_id)
    {
        info!("session signed out");
    }
    (
        StatusCode::FOUND,
        [
            (LOCATION, state.config.origin().to_owned()),
            (
                SET_COOKIE,
                expired_session_cookie(state.config.secure_cookies()),
            ),
        ],
    )
        .into_response()
}

pub fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(LOCATION, location.to_owned())]).into_response()
}

// Errors --------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not authenticated")]
    Unauthenticated,
    #[error("{context}: {source}")]
    Upstream {
        context: &'static str,
        source: FetchError,
    },
    #[error("{0}")]
    InvalidLogin(&'static str),
    #[error("sign-in failed: {0}")]
    SignInFailed(#[from] OAuthError),
}

impl ApiError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Upstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidLogin(_) => StatusCode::BAD_REQUEST,
            Self::SignInFailed(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            Self::Unauthenticated => json!({ "error": "Not authenticated" }),
            Self::Upstream { context, source } => {
                warn!(error = %source, "{context}");
                json!({ "error": context, "details": source.to_string() })
            }
            Self::InvalidLogin(message) => json!({ "error": message }),
            Self::SignInFailed(err) => {
                warn!(error = %err, "sign-in failed");
                json!({ "error": "Failed to sign in with Linear" })
            }
        };
        (status, Json(body)).into_response()
    }
}
