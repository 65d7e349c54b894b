use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use reqwest::{header, Method, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::models::ActivityRecord;
use crate::policy::{ActivityFetcher, FetchContext, RemovalHook};
use crate::tickets::{NewTicket, Ticket, TicketFilter, TicketTracker};

const DEFAULT_API_BASE: &str = "https://api.github.com";
const PAGE_SIZE: usize = 100;

/// Token-authenticated GitHub REST client. `api_base` is overridable for
/// GitHub Enterprise Server deployments.
pub struct GithubClient {
    http: reqwest::Client,
    token: String,
    api_base: String,
}

impl GithubClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base(token, DEFAULT_API_BASE)
    }

    pub fn with_base(token: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.into(),
            api_base: api_base.into(),
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_base, path))
            .bearer_auth(&self.token)
            .header(header::ACCEPT, "application/vnd.github+json")
            .header(header::USER_AGENT, "dormancy-watch")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }
}

/// How to derive an account's activity timestamp from a Copilot seat, which
/// reports both an activity time and an assignment time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ActivitySource {
    /// Newer of last activity and seat assignment.
    MostRecent,
    /// Last activity, falling back to seat assignment when absent.
    Fallback,
    /// Last activity only.
    Ignore,
}

/// Fetches the org's Copilot seats as a complete activity snapshot.
pub struct CopilotSeatFetcher {
    client: Arc<GithubClient>,
    org: String,
    source: ActivitySource,
}

#[derive(Deserialize)]
struct SeatPage {
    total_seats: usize,
    seats: Vec<Seat>,
}

#[derive(Deserialize)]
struct Seat {
    created_at: Option<DateTime<Utc>>,
    last_activity_at: Option<DateTime<Utc>>,
    last_activity_editor: Option<String>,
    assignee: SeatAssignee,
}

#[derive(Deserialize)]
struct SeatAssignee {
    login: String,
}

impl CopilotSeatFetcher {
    pub fn new(client: Arc<GithubClient>, org: impl Into<String>, source: ActivitySource) -> Self {
        Self {
            client,
            org: org.into(),
            source,
        }
    }

    fn to_record(&self, seat: Seat) -> ActivityRecord {
        let last_activity = match self.source {
            ActivitySource::MostRecent => match (seat.last_activity_at, seat.created_at) {
                (Some(activity), Some(assigned)) => Some(activity.max(assigned)),
                (activity, assigned) => activity.or(assigned),
            },
            ActivitySource::Fallback => seat.last_activity_at.or(seat.created_at),
            ActivitySource::Ignore => seat.last_activity_at,
        };

        let mut metadata = serde_json::Map::new();
        if let Some(editor) = seat.last_activity_editor {
            metadata.insert("editor".to_string(), editor.into());
        }

        ActivityRecord {
            login: seat.assignee.login,
            last_activity,
            activity_type: "copilot-seat".to_string(),
            metadata: (!metadata.is_empty()).then_some(metadata),
        }
    }
}

#[async_trait]
impl ActivityFetcher for CopilotSeatFetcher {
    async fn fetch(&self, ctx: &FetchContext) -> anyhow::Result<Vec<ActivityRecord>> {
        debug!(
            org = %self.org,
            since = %ctx.last_fetch_time,
            "listing copilot seats"
        );

        let mut records = Vec::new();
        let mut page = 1usize;
        loop {
            let response: SeatPage = self
                .client
                .request(
                    Method::GET,
                    &format!("/orgs/{}/copilot/billing/seats", self.org),
                )
                .query(&[("per_page", PAGE_SIZE), ("page", page)])
                .send()
                .await
                .context("listing copilot seats")?
                .error_for_status()
                .context("listing copilot seats")?
                .json()
                .await
                .context("decoding copilot seats page")?;

            let fetched = response.seats.len();
            for seat in response.seats {
                records.push(self.to_record(seat));
            }
            if fetched < PAGE_SIZE || records.len() >= response.total_seats {
                break;
            }
            page += 1;
        }

        Ok(records)
    }
}

/// Cancels an account's Copilot seat. Confirms only when the API reports at
/// least one cancelled seat.
pub struct CopilotSeatRemover {
    client: Arc<GithubClient>,
    org: String,
}

#[derive(Deserialize)]
struct SeatsCancelled {
    seats_cancelled: usize,
}

impl CopilotSeatRemover {
    pub fn new(client: Arc<GithubClient>, org: impl Into<String>) -> Self {
        Self {
            client,
            org: org.into(),
        }
    }
}

#[async_trait]
impl RemovalHook for CopilotSeatRemover {
    async fn remove(&self, record: &ActivityRecord) -> anyhow::Result<bool> {
        let response: SeatsCancelled = self
            .client
            .request(
                Method::DELETE,
                &format!("/orgs/{}/copilot/billing/selected_users", self.org),
            )
            .json(&serde_json::json!({ "selected_usernames": [record.login] }))
            .send()
            .await
            .context("cancelling copilot seat")?
            .error_for_status()
            .context("cancelling copilot seat")?
            .json()
            .await
            .context("decoding seat cancellation")?;

        Ok(response.seats_cancelled > 0)
    }
}

/// Notification tickets backed by issues in one repository.
pub struct IssueTracker {
    client: Arc<GithubClient>,
    owner: String,
    repo: String,
}

#[derive(Deserialize)]
struct Issue {
    number: u64,
    title: String,
    state: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    labels: Vec<Label>,
    #[serde(default)]
    assignees: Vec<Assignee>,
    /// Present when the "issue" is really a pull request.
    pull_request: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct Label {
    name: String,
}

#[derive(Deserialize)]
struct Assignee {
    login: String,
}

#[derive(Deserialize)]
struct SearchPage {
    items: Vec<Issue>,
}

impl IssueTracker {
    pub fn new(client: Arc<GithubClient>, repository: &str) -> anyhow::Result<Self> {
        let (owner, repo) = repository
            .split_once('/')
            .context("repository must be given as owner/name")?;
        Ok(Self {
            client,
            owner: owner.to_string(),
            repo: repo.to_string(),
        })
    }

    fn issue_path(&self, rest: &str) -> String {
        format!("/repos/{}/{}/issues{}", self.owner, self.repo, rest)
    }

    fn issue_number(ticket: &Ticket) -> anyhow::Result<u64> {
        ticket
            .identifier
            .parse()
            .context("ticket identifier is not an issue number")
    }

    fn to_ticket(issue: Issue) -> Ticket {
        Ticket {
            identifier: issue.number.to_string(),
            subject_login: issue.title,
            created_at: issue.created_at,
            open: issue.state == "open",
            tags: issue.labels.into_iter().map(|label| label.name).collect(),
            assignees: issue
                .assignees
                .into_iter()
                .map(|assignee| assignee.login)
                .collect(),
        }
    }
}

#[async_trait]
impl TicketTracker for IssueTracker {
    async fn create(&self, ticket: NewTicket) -> anyhow::Result<Ticket> {
        let assignees: Vec<String> = ticket.assignee.into_iter().collect();
        let issue: Issue = self
            .client
            .request(Method::POST, &self.issue_path(""))
            .json(&serde_json::json!({
                "title": ticket.title,
                "body": ticket.body,
                "labels": ticket.tags,
                "assignees": assignees,
            }))
            .send()
            .await
            .context("creating issue")?
            .error_for_status()
            .context("creating issue")?
            .json()
            .await
            .context("decoding created issue")?;
        Ok(Self::to_ticket(issue))
    }

    async fn list(&self, tags: &[String], open_only: bool) -> anyhow::Result<Vec<Ticket>> {
        let state = if open_only { "open" } else { "all" };
        let labels = tags.join(",");
        let mut tickets = Vec::new();
        let mut page = 1usize;
        loop {
            let page_str = page.to_string();
            let per_page = PAGE_SIZE.to_string();
            let issues: Vec<Issue> = self
                .client
                .request(Method::GET, &self.issue_path(""))
                .query(&[
                    ("state", state),
                    ("labels", labels.as_str()),
                    ("per_page", per_page.as_str()),
                    ("page", page_str.as_str()),
                ])
                .send()
                .await
                .context("listing issues")?
                .error_for_status()
                .context("listing issues")?
                .json()
                .await
                .context("decoding issue listing")?;

            let fetched = issues.len();
            tickets.extend(
                issues
                    .into_iter()
                    .filter(|issue| issue.pull_request.is_none())
                    .map(Self::to_ticket),
            );
            if fetched < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(tickets)
    }

    async fn search(&self, filter: &TicketFilter) -> anyhow::Result<Vec<Ticket>> {
        let mut query = format!("repo:{}/{} is:issue is:open", self.owner, self.repo);
        for tag in &filter.tags {
            query.push_str(&format!(" label:\"{tag}\""));
        }
        if let Some(assignee) = &filter.assignee {
            query.push_str(&format!(" assignee:{assignee}"));
        }
        if let Some(title) = &filter.title {
            query.push_str(&format!(" in:title \"{title}\""));
        }

        let page: SearchPage = self
            .client
            .request(Method::GET, "/search/issues")
            .query(&[("q", query.as_str()), ("per_page", "100")])
            .send()
            .await
            .context("searching issues")?
            .error_for_status()
            .context("searching issues")?
            .json()
            .await
            .context("decoding issue search")?;

        Ok(page
            .items
            .into_iter()
            .filter(|issue| issue.pull_request.is_none())
            .map(Self::to_ticket)
            .collect())
    }

    async fn add_tag(&self, ticket: &Ticket, tag: &str) -> anyhow::Result<()> {
        let number = Self::issue_number(ticket)?;
        self.client
            .request(Method::POST, &self.issue_path(&format!("/{number}/labels")))
            .json(&serde_json::json!({ "labels": [tag] }))
            .send()
            .await
            .context("adding label")?
            .error_for_status()
            .context("adding label")?;
        Ok(())
    }

    async fn remove_tag(&self, ticket: &Ticket, tag: &str) -> anyhow::Result<()> {
        let number = Self::issue_number(ticket)?;
        let response = self
            .client
            .request(
                Method::DELETE,
                &self.issue_path(&format!("/{number}/labels/{tag}")),
            )
            .send()
            .await
            .context("removing label")?;
        // Absent label is fine, the tag is gone either way.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        response.error_for_status().context("removing label")?;
        Ok(())
    }

    async fn comment(&self, ticket: &Ticket, body: &str) -> anyhow::Result<()> {
        let number = Self::issue_number(ticket)?;
        self.client
            .request(
                Method::POST,
                &self.issue_path(&format!("/{number}/comments")),
            )
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .context("commenting on issue")?
            .error_for_status()
            .context("commenting on issue")?;
        Ok(())
    }

    async fn close(&self, ticket: &Ticket, reason: Option<&str>) -> anyhow::Result<()> {
        let number = Self::issue_number(ticket)?;
        let mut body = serde_json::Map::new();
        body.insert("state".to_string(), "closed".into());
        if let Some(reason) = reason {
            body.insert("state_reason".to_string(), reason.into());
        }
        self.client
            .request(Method::PATCH, &self.issue_path(&format!("/{number}")))
            .json(&body)
            .send()
            .await
            .context("closing issue")?
            .error_for_status()
            .context("closing issue")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn seat(
        last_activity_at: Option<DateTime<Utc>>,
        created_at: Option<DateTime<Utc>>,
    ) -> Seat {
        Seat {
            created_at,
            last_activity_at,
            last_activity_editor: Some("vscode".to_string()),
            assignee: SeatAssignee {
                login: "mona".to_string(),
            },
        }
    }

    fn fetcher(source: ActivitySource) -> CopilotSeatFetcher {
        CopilotSeatFetcher::new(Arc::new(GithubClient::new("token")), "acme", source)
    }

    #[test]
    fn most_recent_prefers_the_newer_timestamp() {
        let activity = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let assigned = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();

        let record = fetcher(ActivitySource::MostRecent)
            .to_record(seat(Some(activity), Some(assigned)));
        assert_eq!(record.last_activity, Some(assigned));
    }

    #[test]
    fn fallback_uses_assignment_only_when_activity_is_absent() {
        let assigned = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();

        let record = fetcher(ActivitySource::Fallback).to_record(seat(None, Some(assigned)));
        assert_eq!(record.last_activity, Some(assigned));

        let activity = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let record =
            fetcher(ActivitySource::Fallback).to_record(seat(Some(activity), Some(assigned)));
        assert_eq!(record.last_activity, Some(activity));
    }

    #[test]
    fn ignore_keeps_unobserved_seats_unobserved() {
        let assigned = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let record = fetcher(ActivitySource::Ignore).to_record(seat(None, Some(assigned)));
        assert_eq!(record.last_activity, None);
    }

    #[test]
    fn seat_metadata_carries_the_editor() {
        let record = fetcher(ActivitySource::Ignore).to_record(seat(None, None));
        let metadata = record.metadata.unwrap();
        assert_eq!(metadata.get("editor").unwrap(), "vscode");
    }

    #[test]
    fn issue_tracker_requires_owner_and_name() {
        let client = Arc::new(GithubClient::new("token"));
        assert!(IssueTracker::new(Arc::clone(&client), "acme/dormancy").is_ok());
        assert!(IssueTracker::new(client, "acme").is_err());
    }
}
