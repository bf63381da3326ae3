use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use reqwest::{Client, StatusCode, header::ACCEPT};
use serde::{Deserialize, Deserializer, de::DeserializeOwned};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{Issue, IssueState, User, Viewer, Workspace};

const USER_AGENT_HEADER: &str = "linear-timeline/0.1";
const ISSUE_PAGE_SIZE: usize = 100;
const DUE_DATE_LOOKBACK_DAYS: i64 = 30;
const MAX_LOGGED_BODY: usize = 200;

const VIEWER_QUERY: &str = "query { viewer { id name email avatarUrl } }";
const USER_FIELDS: &str = "id name displayName avatarUrl";

pub fn build_client() -> Result<Client, FetchError> {
    Client::builder()
        .user_agent(USER_AGENT_HEADER)
        .build()
        .map_err(FetchError::Http)
}

/// Stateless GraphQL client for the issue tracker. Every call carries the
/// caller's bearer token; nothing is cached between calls.
#[derive(Clone, Debug)]
pub struct TrackerClient {
    endpoint: String,
    client: Client,
}

impl TrackerClient {
    pub fn with_client(endpoint: impl Into<String>, client: Client) -> Self {
        Self {
            endpoint: endpoint.into(),
            client,
        }
    }

    /// Issues and users in a single batched query.
    pub async fn fetch_workspace(
        &self,
        token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Workspace, FetchError> {
        let query = format!(
            "query {{ {} users {{ nodes {{ {USER_FIELDS} }} }} }}",
            issues_selection(now)
        );
        let data: WorkspaceData = self.execute(token, &query).await?;
        let workspace = Workspace {
            issues: data.issues.nodes.into_iter().map(normalize_issue).collect(),
            users: data.users.nodes.into_iter().map(normalize_user).collect(),
        };
        info!(
            issues = workspace.issues.len(),
            users = workspace.users.len(),
            "fetched workspace from Linear"
        );
        Ok(workspace)
    }

    pub async fn fetch_issues(
        &self,
        token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Issue>, FetchError> {
        let query = format!("query {{ {} }}", issues_selection(now));
        let data: IssuesData = self.execute(token, &query).await?;
        info!(count = data.issues.nodes.len(), "fetched issues from Linear");
        Ok(data.issues.nodes.into_iter().map(normalize_issue).collect())
    }

    pub async fn fetch_users(&self, token: Option<&str>) -> Result<Vec<User>, FetchError> {
        let query = format!("query {{ users {{ nodes {{ {USER_FIELDS} }} }} }}");
        let data: UsersData = self.execute(token, &query).await?;
        info!(count = data.users.nodes.len(), "fetched users from Linear");
        Ok(data.users.nodes.into_iter().map(normalize_user).collect())
    }

    /// Looks up the account that owns `token`. A payload without
    /// `data.viewer` is malformed.
    pub async fn fetch_viewer(&self, token: &str) -> Result<Viewer, FetchError> {
        let data: ViewerData = self.execute(Some(token), VIEWER_QUERY).await?;
        let viewer = data.viewer.ok_or_else(|| {
            FetchError::Malformed("response did not include data.viewer".to_owned())
        })?;
        Ok(Viewer {
            id: viewer.id,
            name: non_empty(viewer.name).unwrap_or_else(|| "Linear User".to_owned()),
            email: non_empty(viewer.email),
            avatar_url: non_empty(viewer.avatar_url),
        })
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        token: Option<&str>,
        query: &str,
    ) -> Result<T, FetchError> {
        let token = token
            .filter(|token| !token.trim().is_empty())
            .ok_or(FetchError::Unauthenticated)?;

        debug!(endpoint = %self.endpoint, "sending GraphQL query");
        let response = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "application/json")
            .bearer_auth(token)
            .json(&json!({ "query": query }))
            .send()
            .await
            .inspect_err(|err| {
                warn!(endpoint = %self.endpoint, error = %err, "Linear API request failed");
            })?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            warn!(
                endpoint = %self.endpoint,
                status = status.as_u16(),
                body = %truncate_for_log(&body),
                "Linear API returned an error status"
            );
            return Err(FetchError::Upstream {
                status,
                body: truncate_for_log(&body),
            });
        }

        let envelope: GraphqlEnvelope = serde_json::from_str(&body).map_err(|err| {
            warn!(endpoint = %self.endpoint, error = %err, "Linear API returned non-JSON body");
            FetchError::Malformed(format!("response is not a GraphQL envelope: {err}"))
        })?;

        if let Some(errors) = envelope.errors.filter(|errors| !errors.is_empty()) {
            let message = errors
                .into_iter()
                .map(|error| error.message)
                .collect::<Vec<_>>()
                .join("; ");
            warn!(
                endpoint = %self.endpoint,
                status = status.as_u16(),
                errors = %truncate_for_log(&message),
                "Linear API returned GraphQL errors"
            );
            return Err(FetchError::Upstream {
                status,
                body: truncate_for_log(&body),
            });
        }

        let data = envelope
            .data
            .filter(|data| !data.is_null())
            .ok_or_else(|| FetchError::Malformed("response did not include data".to_owned()))?;

        serde_json::from_value(data).map_err(|err| {
            warn!(endpoint = %self.endpoint, error = %err, "Linear API payload failed validation");
            FetchError::Malformed(err.to_string())
        })
    }
}

fn issues_selection(now: DateTime<Utc>) -> String {
    let since = (now - Duration::days(DUE_DATE_LOOKBACK_DAYS))
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    format!(
        "issues(first: {ISSUE_PAGE_SIZE}, filter: {{ dueDate: {{ gte: \"{since}\" }} }}) {{ \
         nodes {{ id title identifier description priority \
         state {{ id name color }} \
         assignee {{ {USER_FIELDS} }} \
         startedAt dueDate completedAt createdAt updatedAt url }} }}"
    )
}

fn normalize_issue(node: IssueNode) -> Issue {
    let state = match node.state {
        Some(state) => IssueState {
            id: non_empty(state.id).unwrap_or_else(|| IssueState::UNKNOWN_ID.to_owned()),
            name: non_empty(state.name).unwrap_or_else(|| IssueState::UNKNOWN_NAME.to_owned()),
            color: non_empty(state.color),
        },
        None => IssueState::unknown(),
    };

    Issue {
        id: node.id,
        title: node.title,
        identifier: node.identifier,
        description: non_empty(node.description),
        priority: node
            .priority
            .filter(|priority| priority.is_finite())
            .map(|priority| priority.round() as i64),
        state,
        assignee: node.assignee.map(normalize_user),
        started_at: node.started_at,
        due_date: node.due_date,
        completed_at: node.completed_at,
        created_at: node.created_at,
        updated_at: node.updated_at,
        url: node.url,
    }
}

fn normalize_user(node: UserNode) -> User {
    let display_name = non_empty(node.display_name).unwrap_or_else(|| node.name.clone());
    User {
        id: node.id,
        name: node.name,
        display_name,
        avatar_url: non_empty(node.avatar_url),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

pub(crate) fn truncate_for_log(body: &str) -> String {
    if body.chars().count() <= MAX_LOGGED_BODY {
        body.to_owned()
    } else {
        format!("{}...", body.chars().take(MAX_LOGGED_BODY).collect::<String>())
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Linear API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("No access token for this session")]
    Unauthenticated,
    #[error("Linear API error: {status} {body}")]
    Upstream { status: StatusCode, body: String },
    #[error("Unexpected Linear API response: {0}")]
    Malformed(String),
}

impl FetchError {
    /// The tracker rejected the token itself, i.e. the session has expired
    /// or been revoked upstream.
    pub fn is_token_rejected(&self) -> bool {
        matches!(self, Self::Upstream { status, .. } if *status == StatusCode::UNAUTHORIZED)
    }
}

// Response payloads ---------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GraphqlEnvelope {
    data: Option<serde_json::Value>,
    errors: Option<Vec<GraphqlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Connection<T> {
    nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct WorkspaceData {
    issues: Connection<IssueNode>,
    users: Connection<UserNode>,
}

#[derive(Debug, Deserialize)]
struct IssuesData {
    issues: Connection<IssueNode>,
}

#[derive(Debug, Deserialize)]
struct UsersData {
    users: Connection<UserNode>,
}

#[derive(Debug, Deserialize)]
struct ViewerData {
    viewer: Option<ViewerNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ViewerNode {
    id: String,
    name: Option<String>,
    email: Option<String>,
    avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueNode {
    id: String,
    title: String,
    identifier: String,
    description: Option<String>,
    priority: Option<f64>,
    state: Option<StateNode>,
    assignee: Option<UserNode>,
    started_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_due_date")]
    due_date: Option<NaiveDate>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct StateNode {
    id: Option<String>,
    name: Option<String>,
    color: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserNode {
    id: String,
    name: String,
    display_name: Option<String>,
    avatar_url: Option<String>,
}

// Linear sends `dueDate` as a bare calendar date; accept full timestamps too.
fn deserialize_due_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if let Ok(date) = NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
        return Ok(Some(date));
    }
    DateTime::parse_from_rfc3339(&raw)
        .map(|timestamp| Some(timestamp.with_timezone(&Utc).date_naive()))
        .map_err(|_| serde::de::Error::custom(format!("invalid dueDate: {raw}")))
}

// -------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------
