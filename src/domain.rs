use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

// Domain data structures shared across modules.

/// Provider access token held by a signed-in session.
#[derive(Clone)]
pub struct Credential {
    pub bearer_token: String,
    pub issued_at: DateTime<Utc>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Credential")
            .field("bearer_token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// The signed-in Linear account, as reported by the `viewer` query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Viewer {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: String,
    pub title: String,
    pub identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    pub state: IssueState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub url: String,
}

impl Issue {
    pub fn assignee_id(&self) -> Option<&str> {
        self.assignee.as_ref().map(|user| user.id.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IssueState {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl IssueState {
    pub const UNKNOWN_ID: &'static str = "unknown";
    pub const UNKNOWN_NAME: &'static str = "Unknown";

    /// Stand-in for issues the tracker returned without a workflow state.
    pub fn unknown() -> Self {
        Self {
            id: Self::UNKNOWN_ID.to_owned(),
            name: Self::UNKNOWN_NAME.to_owned(),
            color: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl User {
    pub fn label(&self) -> &str {
        if self.display_name.trim().is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }
}

/// Issues and users fetched together for one timeline load.
#[derive(Clone, Debug, Default)]
pub struct Workspace {
    pub issues: Vec<Issue>,
    pub users: Vec<User>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_debug_hides_token() {
        let credential = Credential {
            bearer_token: "lin_oauth_secret".into(),
            issued_at: Utc::now(),
        };
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("lin_oauth_secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn user_label_falls_back_to_name() {
        let user = User {
            id: "u1".into(),
            name: "ada".into(),
            display_name: "  ".into(),
            avatar_url: None,
        };
        assert_eq!(user.label(), "ada");
    }
}
