use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

/// One ticket in the external tracker. The title carries the subject login;
/// `identifier` is the opaque handle used for updates.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub identifier: String,
    pub subject_login: String,
    pub created_at: DateTime<Utc>,
    pub open: bool,
    pub tags: Vec<String>,
    pub assignees: Vec<String>,
}

impl Ticket {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Fields of a ticket to be created.
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
    pub assignee: Option<String>,
}

/// Lookup criteria for open tickets.
#[derive(Debug, Clone, Default)]
pub struct TicketFilter {
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub assignee: Option<String>,
}

impl TicketFilter {
    pub fn matches(&self, ticket: &Ticket) -> bool {
        if !ticket.open {
            return false;
        }
        if let Some(title) = &self.title {
            if &ticket.subject_login != title {
                return false;
            }
        }
        if !self.tags.iter().all(|tag| ticket.has_tag(tag)) {
            return false;
        }
        if let Some(assignee) = &self.assignee {
            if !ticket.assignees.iter().any(|a| a == assignee) {
                return false;
            }
        }
        true
    }
}

/// Minimal contract against an external mutable ticket collection.
#[async_trait]
pub trait TicketTracker: Send + Sync {
    async fn create(&self, ticket: NewTicket) -> anyhow::Result<Ticket>;

    /// Lists tickets carrying all of `tags`, optionally restricted to open
    /// ones. Trackers may apply the tag filter server-side or not at all;
    /// callers re-filter.
    async fn list(&self, tags: &[String], open_only: bool) -> anyhow::Result<Vec<Ticket>>;

    /// Structured query by title/tags/assignee, where the backend supports
    /// one. Less reliable than listing in some deployments.
    async fn search(&self, filter: &TicketFilter) -> anyhow::Result<Vec<Ticket>>;

    async fn add_tag(&self, ticket: &Ticket, tag: &str) -> anyhow::Result<()>;
    async fn remove_tag(&self, ticket: &Ticket, tag: &str) -> anyhow::Result<()>;
    async fn comment(&self, ticket: &Ticket, body: &str) -> anyhow::Result<()>;
    async fn close(&self, ticket: &Ticket, reason: Option<&str>) -> anyhow::Result<()>;
}

/// One strategy for locating the open tickets a sweep should consider.
#[async_trait]
pub trait TicketFinder: Send + Sync {
    async fn open_tickets(&self, filter: &TicketFilter) -> anyhow::Result<Vec<Ticket>>;
}

/// Finder backed by the tracker's structured search.
pub struct SearchFinder {
    tracker: Arc<dyn TicketTracker>,
}

impl SearchFinder {
    pub fn new(tracker: Arc<dyn TicketTracker>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl TicketFinder for SearchFinder {
    async fn open_tickets(&self, filter: &TicketFilter) -> anyhow::Result<Vec<Ticket>> {
        let tickets = self.tracker.search(filter).await?;
        Ok(tickets.into_iter().filter(|t| filter.matches(t)).collect())
    }
}

/// Finder that lists everything and filters in memory. Slower, but works
/// where the structured search is unavailable.
pub struct ListingFinder {
    tracker: Arc<dyn TicketTracker>,
}

impl ListingFinder {
    pub fn new(tracker: Arc<dyn TicketTracker>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl TicketFinder for ListingFinder {
    async fn open_tickets(&self, filter: &TicketFilter) -> anyhow::Result<Vec<Ticket>> {
        let tickets = self.tracker.list(&filter.tags, true).await?;
        Ok(tickets.into_iter().filter(|t| filter.matches(t)).collect())
    }
}

/// Tries each finder in order, falling through on failure. Only errors when
/// every finder fails.
pub async fn find_open_tickets(
    finders: &[Box<dyn TicketFinder>],
    filter: &TicketFilter,
) -> anyhow::Result<Vec<Ticket>> {
    let mut last_err = None;
    for finder in finders {
        match finder.open_tickets(filter).await {
            Ok(tickets) => return Ok(tickets),
            Err(err) => {
                warn!(error = %err, "ticket lookup failed, trying next finder");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no ticket finder configured")))
}
