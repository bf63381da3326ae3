//! Issue-to-timeline projection.
//!
//! Everything here is a pure function of its inputs: the same issues, users,
//! assignee filter and `now` always produce the same groups and rows.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, NaiveTime, Utc};
use serde::Serialize;

use crate::domain::{Issue, IssueState, User};

pub const UNASSIGNED_GROUP_ID: &str = "unassigned";
pub const UNASSIGNED_GROUP_TITLE: &str = "Unassigned";

/// Calendar days subtracted from every displayed instant. The timeline
/// renderer draws bars two days late; shifting start, end and the today
/// marker together keeps relative positions intact.
pub const DISPLAY_SHIFT_DAYS: i64 = 2;

pub const COLOR_DONE: &str = "#2ecc71";
pub const COLOR_BACKLOG: &str = "#95a5a6";
pub const COLOR_IN_PROGRESS: &str = "#f39c12";
pub const COLOR_BLOCKED: &str = "#e74c3c";
pub const COLOR_DEFAULT: &str = "#3498db";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TimelineGroup {
    pub id: String,
    pub title: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineRow {
    pub id: String,
    pub group_id: String,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub color: String,
    pub url: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ViewWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Projection {
    pub groups: Vec<TimelineGroup>,
    pub rows: Vec<TimelineRow>,
    pub today: DateTime<Utc>,
    pub window: ViewWindow,
}

pub fn project(
    issues: &[Issue],
    users: &[User],
    selected_user_id: Option<&str>,
    now: DateTime<Utc>,
) -> Projection {
    let rows: Vec<TimelineRow> = issues
        .iter()
        .filter(|issue| match selected_user_id {
            Some(selected) => issue.assignee_id() == Some(selected),
            None => true,
        })
        .map(project_issue)
        .collect();

    Projection {
        groups: build_groups(issues, users),
        rows,
        today: shift_for_display(now),
        window: view_window(now),
    }
}

/// Moves an instant into display space. Apply to every instant handed to the
/// renderer and nothing else.
pub fn shift_for_display(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant - Duration::days(DISPLAY_SHIFT_DAYS)
}

/// Start and end of an issue's bar before the display shift. The end never
/// precedes the start: a missing or earlier end becomes `start + 1 day`.
pub fn issue_bounds(issue: &Issue) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = issue.started_at.unwrap_or(issue.created_at);
    let end = issue
        .due_date
        .map(midnight)
        .or(issue.completed_at)
        .filter(|end| *end >= start)
        .unwrap_or_else(|| start + Duration::days(1));
    (start, end)
}

pub fn state_color(state: &IssueState) -> String {
    if let Some(color) = state.color.as_deref().filter(|color| !color.trim().is_empty()) {
        return color.to_owned();
    }

    let name = state.name.to_lowercase();
    let color = if name.contains("done") || name.contains("complete") {
        COLOR_DONE
    } else if name.contains("backlog") {
        COLOR_BACKLOG
    } else if name.contains("in progress") {
        COLOR_IN_PROGRESS
    } else if name.contains("blocked") {
        COLOR_BLOCKED
    } else {
        COLOR_DEFAULT
    };
    color.to_owned()
}

/// Default visible range: from the start of the month before the shifted
/// `now` through the end of the second month after it.
pub fn view_window(now: DateTime<Utc>) -> ViewWindow {
    let this_month = first_of_month(shift_for_display(now).date_naive());
    let start = first_of_month(this_month - Days::new(1));
    let mut end_exclusive = this_month;
    for _ in 0..3 {
        end_exclusive = first_of_month(end_exclusive + Days::new(31));
    }
    ViewWindow {
        start: midnight(start),
        end: midnight(end_exclusive) - Duration::milliseconds(1),
    }
}

fn project_issue(issue: &Issue) -> TimelineRow {
    let (start, end) = issue_bounds(issue);
    TimelineRow {
        id: issue.id.clone(),
        group_id: issue
            .assignee_id()
            .unwrap_or(UNASSIGNED_GROUP_ID)
            .to_owned(),
        title: format!("{}: {}", issue.identifier, issue.title),
        start_time: shift_for_display(start),
        end_time: shift_for_display(end),
        color: state_color(&issue.state),
        url: issue.url.clone(),
    }
}

// Unassigned first, then users in upstream order. Assignees missing from the
// user list (e.g. deactivated accounts) still get a group so no row is orphaned.
fn build_groups(issues: &[Issue], users: &[User]) -> Vec<TimelineGroup> {
    let mut groups = Vec::with_capacity(users.len() + 1);
    groups.push(TimelineGroup {
        id: UNASSIGNED_GROUP_ID.to_owned(),
        title: UNASSIGNED_GROUP_TITLE.to_owned(),
    });

    let mut seen: HashSet<&str> = HashSet::new();
    seen.insert(UNASSIGNED_GROUP_ID);
    let assignees = issues.iter().filter_map(|issue| issue.assignee.as_ref());
    for user in users.iter().chain(assignees) {
        if seen.insert(user.id.as_str()) {
            groups.push(TimelineGroup {
                id: user.id.clone(),
                title: user.label().to_owned(),
            });
        }
    }
    groups
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date - Days::new(u64::from(date.day0()))
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn now() -> DateTime<Utc> {
        ts(2024, 3, 15, 12)
    }

    fn user(id: &str, name: &str, display_name: &str) -> User {
        User {
            id: id.into(),
            name: name.into(),
            display_name: display_name.into(),
            avatar_url: None,
        }
    }

    fn issue(id: &str, state: &str, assignee: Option<User>) -> Issue {
        Issue {
            id: id.into(),
            title: format!("Issue {id}"),
            identifier: format!("ENG-{id}"),
            description: None,
            priority: None,
            state: IssueState {
                id: format!("state-{state}"),
                name: state.into(),
                color: None,
            },
            assignee,
            started_at: None,
            due_date: None,
            completed_at: None,
            created_at: ts(2024, 1, 1, 0),
            updated_at: ts(2024, 1, 2, 0),
            url: format!("https://linear.app/acme/issue/ENG-{id}"),
        }
    }

    #[test]
    fn unassigned_backlog_issue_gets_gray_one_day_row() {
        let projection = project(&[issue("I1", "Backlog", None)], &[], None, now());

        assert_eq!(projection.rows.len(), 1);
        let row = &projection.rows[0];
        assert_eq!(row.group_id, UNASSIGNED_GROUP_ID);
        assert_eq!(row.color, COLOR_BACKLOG);
        assert_eq!(row.title, "ENG-I1: Issue I1");
        assert_eq!(row.start_time, ts(2023, 12, 30, 0));
        assert_eq!(row.end_time - row.start_time, Duration::days(1));
        assert_eq!(
            projection.groups,
            vec![TimelineGroup {
                id: UNASSIGNED_GROUP_ID.into(),
                title: UNASSIGNED_GROUP_TITLE.into(),
            }]
        );
    }

    #[test]
    fn unassigned_group_present_without_unassigned_issues() {
        let ada = user("u1", "ada", "Ada");
        let projection = project(
            &[issue("I1", "Todo", Some(ada.clone()))],
            &[ada],
            None,
            now(),
        );
        let ids: Vec<_> = projection.groups.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, [UNASSIGNED_GROUP_ID, "u1"]);
        assert_eq!(projection.groups[1].title, "Ada");
    }

    #[test]
    fn group_label_falls_back_to_name() {
        let projection = project(&[], &[user("u1", "ada", "")], None, now());
        assert_eq!(projection.groups[1].title, "ada");
    }

    #[test]
    fn assignee_missing_from_user_list_still_gets_group() {
        let ghost = user("u9", "ghost", "Ghost");
        let projection = project(&[issue("I1", "Todo", Some(ghost))], &[], None, now());
        assert!(projection.groups.iter().any(|group| group.id == "u9"));
        for row in &projection.rows {
            assert!(projection.groups.iter().any(|group| group.id == row.group_id));
        }
    }

    #[test]
    fn bounds_prefer_started_and_due_dates() {
        let mut item = issue("I1", "Todo", None);
        item.started_at = Some(ts(2024, 2, 10, 9));
        item.due_date = NaiveDate::from_ymd_opt(2024, 2, 20);
        item.completed_at = Some(ts(2024, 2, 25, 0));
        assert_eq!(issue_bounds(&item), (ts(2024, 2, 10, 9), ts(2024, 2, 20, 0)));

        item.due_date = None;
        assert_eq!(issue_bounds(&item), (ts(2024, 2, 10, 9), ts(2024, 2, 25, 0)));
    }

    #[test]
    fn end_never_precedes_start() {
        let mut item = issue("I1", "Todo", None);
        item.started_at = Some(ts(2024, 2, 10, 9));
        item.due_date = NaiveDate::from_ymd_opt(2024, 2, 1);
        let (start, end) = issue_bounds(&item);
        assert_eq!(end, start + Duration::days(1));

        let projection = project(&[item], &[], None, now());
        assert!(projection.rows[0].end_time >= projection.rows[0].start_time);
    }

    #[test]
    fn display_shift_applies_to_bounds_and_today() {
        let mut item = issue("I1", "Todo", None);
        item.started_at = Some(ts(2024, 3, 10, 0));
        item.due_date = NaiveDate::from_ymd_opt(2024, 3, 12);
        let projection = project(&[item], &[], None, now());

        assert_eq!(projection.rows[0].start_time, ts(2024, 3, 8, 0));
        assert_eq!(projection.rows[0].end_time, ts(2024, 3, 10, 0));
        assert_eq!(projection.today, ts(2024, 3, 13, 12));
        assert_eq!(shift_for_display(now()), now() - Duration::days(2));
    }

    #[test]
    fn filter_keeps_only_selected_assignee() {
        let ada = user("u1", "ada", "Ada");
        let bob = user("u2", "bob", "Bob");
        let issues = vec![
            issue("I1", "Todo", Some(ada.clone())),
            issue("I2", "Todo", Some(bob.clone())),
            issue("I3", "Todo", None),
            issue("I4", "Todo", Some(ada.clone())),
        ];
        let users = vec![ada, bob];

        let filtered = project(&issues, &users, Some("u1"), now());
        let ids: Vec<_> = filtered.rows.iter().map(|row| row.id.as_str()).collect();
        assert_eq!(ids, ["I1", "I4"]);
        assert_eq!(filtered.groups.len(), 3);

        let all = project(&issues, &users, None, now());
        assert_eq!(all.rows.len(), 4);
    }

    #[test]
    fn filter_for_unknown_user_yields_no_rows() {
        let issues = vec![issue("I1", "Todo", None)];
        assert!(project(&issues, &[], Some("nobody"), now()).rows.is_empty());
    }

    #[test]
    fn state_color_keyword_precedence() {
        let color = |name: &str| {
            state_color(&IssueState {
                id: "s".into(),
                name: name.into(),
                color: None,
            })
        };
        assert_eq!(color("Done"), COLOR_DONE);
        assert_eq!(color("Completed"), COLOR_DONE);
        assert_eq!(color("Backlog"), COLOR_BACKLOG);
        assert_eq!(color("In Progress"), COLOR_IN_PROGRESS);
        assert_eq!(color("BLOCKED"), COLOR_BLOCKED);
        assert_eq!(color("Done but blocked"), COLOR_DONE);
        assert_eq!(color("Todo"), COLOR_DEFAULT);
    }

    #[test]
    fn explicit_state_color_wins() {
        let mut item = issue("I1", "In Progress", None);
        item.state.color = Some("#abcdef".into());
        let projection = project(&[item], &[], None, now());
        assert_eq!(projection.rows[0].color, "#abcdef");
    }

    #[test]
    fn projection_is_deterministic() {
        let ada = user("u1", "ada", "Ada");
        let issues = vec![
            issue("I1", "Backlog", Some(ada.clone())),
            issue("I2", "Done", None),
        ];
        let users = vec![ada];
        let first = project(&issues, &users, None, now());
        let second = project(&issues, &users, None, now());
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).expect("json"),
            serde_json::to_string(&second).expect("json")
        );
    }

    #[test]
    fn view_window_spans_previous_to_second_next_month() {
        let window = view_window(now());
        assert_eq!(window.start, ts(2024, 2, 1, 0));
        assert_eq!(window.end, ts(2024, 6, 1, 0) - Duration::milliseconds(1));
    }

    #[test]
    fn view_window_uses_shifted_now_near_month_start() {
        let window = view_window(ts(2024, 3, 1, 12));
        assert_eq!(window.start, ts(2024, 1, 1, 0));
        assert_eq!(window.end, ts(2024, 5, 1, 0) - Duration::milliseconds(1));
    }

    #[test]
    fn rows_serialize_with_camel_case_keys() {
        let projection = project(&[issue("I1", "Todo", None)], &[], None, now());
        let value = serde_json::to_value(&projection.rows[0]).expect("json");
        assert_eq!(value["groupId"], UNASSIGNED_GROUP_ID);
        assert!(value.get("startTime").is_some());
        assert!(value.get("endTime").is_some());
    }
}
