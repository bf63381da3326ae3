use std::fmt::Write as _;

use axum::{
    Extension,
    extract::{Query, State},
    http::Uri,
    response::{Html, IntoResponse, Response},
};
use chrono::{DateTime, Utc};

use crate::{
    domain::{User, Viewer},
    gate,
    projection::{self, Projection, TimelineRow},
    server::{ApiError, AppState, TimelineQuery, found},
    session::SessionContext,
};

pub const APP_NAME: &str = "Linear Timeline";

/// Landing page and timeline shell. Signed-out visitors get a sign-in prompt;
/// signed-in visitors get one batched fetch rendered as grouped rows.
pub async fn home(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Query(query): Query<TimelineQuery>,
    uri: Uri,
) -> Response {
    if !session.is_authenticated() {
        return Html(render_signed_out()).into_response();
    }

    let now = Utc::now();
    match state
        .tracker
        .fetch_workspace(session.bearer_token(), now)
        .await
    {
        Ok(workspace) => {
            let selected = query.selected_assignee();
            let projection =
                projection::project(&workspace.issues, &workspace.users, selected, now);
            Html(render_timeline(
                &projection,
                &workspace.users,
                selected,
                session.viewer(),
            ))
            .into_response()
        }
        Err(err) => {
            match state.upstream_failure(&session, "Failed to load data from Linear", err) {
                ApiError::Unauthenticated => {
                    found(&gate::login_redirect(state.config.origin(), uri.path()))
                }
                other => {
                    let detail = state.config.dev.then(|| other.to_string());
                    (other.status_code(), Html(render_error(detail.as_deref()))).into_response()
                }
            }
        }
    }
}

fn render_signed_out() -> String {
    layout(
        None,
        "<section class=\"welcome\">\
         <h2>Welcome to Linear Timeline Viewer</h2>\
         <p>Please sign in with Linear to view your issues timeline.</p>\
         <p><a class=\"button\" href=\"/api/auth/signin?callbackUrl=%2F\">Sign in with Linear</a></p>\
         </section>",
    )
}

fn render_error(detail: Option<&str>) -> String {
    let mut body = String::from(
        "<div class=\"error\" role=\"alert\"><strong>Error: </strong>\
         Failed to load data from Linear. Reload the page to try again.",
    );
    if let Some(detail) = detail {
        let _ = write!(body, "<pre>{}</pre>", escape(detail));
    }
    body.push_str("</div>");
    layout(None, &body)
}

fn render_timeline(
    projection: &Projection,
    users: &[User],
    selected: Option<&str>,
    viewer: Option<&Viewer>,
) -> String {
    let mut body = String::new();

    body.push_str("<form method=\"get\" class=\"filter\"><label>Filter by assignee: ");
    body.push_str("<select name=\"assignee\" onchange=\"this.form.submit()\">");
    body.push_str("<option value=\"\">All Users</option>");
    for user in users {
        let marker = if selected == Some(user.id.as_str()) {
            " selected"
        } else {
            ""
        };
        let _ = write!(
            body,
            "<option value=\"{}\"{marker}>{}</option>",
            escape(&user.id),
            escape(user.label())
        );
    }
    body.push_str("</select></label><noscript><button>Apply</button></noscript></form>");

    let _ = write!(
        body,
        "<p class=\"window\">{} to {} &middot; today {}</p>",
        format_day(projection.window.start),
        format_day(projection.window.end),
        format_day(projection.today)
    );

    body.push_str("<table class=\"timeline\"><thead><tr><th>Assignee</th><th>Issue</th><th>Start</th><th>End</th></tr></thead><tbody>");
    for group in &projection.groups {
        let rows: Vec<&TimelineRow> = projection
            .rows
            .iter()
            .filter(|row| row.group_id == group.id)
            .collect();
        let _ = write!(
            body,
            "<tr class=\"group\"><th colspan=\"4\">{}</th></tr>",
            escape(&group.title)
        );
        for row in rows {
            let _ = write!(
                body,
                "<tr><td></td><td><span class=\"swatch\" style=\"background:{}\"></span>\
                 <a href=\"{}\">{}</a></td><td>{}</td><td>{}</td></tr>",
                escape(&row.color),
                escape(&row.url),
                escape(&row.title),
                format_day(row.start_time),
                format_day(row.end_time)
            );
        }
    }
    body.push_str("</tbody></table>");

    layout(viewer, &body)
}

fn layout(viewer: Option<&Viewer>, body: &str) -> String {
    let mut nav = String::new();
    if let Some(viewer) = viewer {
        let _ = write!(
            nav,
            "<span>{}</span><form method=\"post\" action=\"/api/auth/signout\">\
             <button>Sign out</button></form>",
            escape(&viewer.name)
        );
    }
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{APP_NAME}</title>\
         <style>body{{font-family:sans-serif;margin:0;background:#f9fafb}}\
         nav{{display:flex;justify-content:space-between;padding:1rem;background:#fff}}\
         main{{padding:1rem}}.error{{background:#fee2e2;border:1px solid #f87171;padding:1rem}}\
         .swatch{{display:inline-block;width:.75rem;height:.75rem;border-radius:2px;margin-right:.5rem}}\
         table{{border-collapse:collapse;width:100%;background:#fff}}td,th{{padding:.25rem .5rem;text-align:left}}\
         tr.group th{{background:#f3f4f6}}</style></head>\
         <body><nav><strong>{APP_NAME}</strong><div>{nav}</div></nav><main>{body}</main></body></html>"
    )
}

fn format_day(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%d").to_string()
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::domain::{Issue, IssueState};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
    }

    fn sample() -> (Vec<Issue>, Vec<User>) {
        let ada = User {
            id: "u1".into(),
            name: "ada".into(),
            display_name: "Ada <Admin>".into(),
            avatar_url: None,
        };
        let issue = Issue {
            id: "I1".into(),
            title: "Fix <script>".into(),
            identifier: "ENG-1".into(),
            description: None,
            priority: None,
            state: IssueState::unknown(),
            assignee: Some(ada.clone()),
            started_at: None,
            due_date: None,
            completed_at: None,
            created_at: now(),
            updated_at: now(),
            url: "https://linear.app/acme/issue/ENG-1".into(),
        };
        (vec![issue], vec![ada])
    }

    #[test]
    fn escape_handles_markup() {
        assert_eq!(escape("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }

    #[test]
    fn timeline_page_escapes_titles_and_marks_selection() {
        let (issues, users) = sample();
        let projection = projection::project(&issues, &users, Some("u1"), now());
        let html = render_timeline(&projection, &users, Some("u1"), None);

        assert!(html.contains("ENG-1: Fix &lt;script&gt;"));
        assert!(html.contains("<option value=\"u1\" selected>Ada &lt;Admin&gt;</option>"));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn filtered_page_still_renders_every_group() {
        let (issues, users) = sample();
        let projection = projection::project(&issues, &users, Some("nobody"), now());
        let html = render_timeline(&projection, &users, Some("nobody"), None);

        assert!(html.contains("<th colspan=\"4\">Unassigned</th>"));
        assert!(html.contains("<th colspan=\"4\">Ada &lt;Admin&gt;</th>"));
        assert!(!html.contains("ENG-1"));
    }

    #[test]
    fn timeline_page_lists_unassigned_group_without_filter() {
        let (issues, users) = sample();
        let projection = projection::project(&issues, &users, None, now());
        let html = render_timeline(&projection, &users, None, None);
        assert!(html.contains("Unassigned"));
    }

    #[test]
    fn error_banner_shows_detail_only_when_given() {
        assert!(!render_error(None).contains("<pre>"));
        assert!(render_error(Some("Linear API error: 502")).contains("<pre>Linear API error: 502</pre>"));
    }

    #[test]
    fn signed_out_page_links_to_login() {
        assert!(render_signed_out().contains("/api/auth/signin"));
    }
}
