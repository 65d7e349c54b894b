use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::ActivityRecord;
use crate::policy::RemovalHook;
use crate::tickets::{
    find_open_tickets, NewTicket, Ticket, TicketFilter, TicketFinder, TicketTracker,
};

/// Tag on every open notification awaiting the grace period.
pub const PENDING_REMOVAL_TAG: &str = "pending-removal";
/// Tag applied when the subject reappeared active before removal.
pub const BECAME_ACTIVE_TAG: &str = "became-active";
/// Tag applied when the subject was removed after the grace period.
pub const REMOVED_TAG: &str = "removed";
/// Default admin-applied tag that parks a ticket indefinitely.
pub const DEFAULT_EXCLUSION_TAG: &str = "dormancy-exempt";

pub struct LifecycleConfig {
    pub check: String,
    /// Tags identifying this check's tickets among everything else in the
    /// tracker.
    pub base_tags: Vec<String>,
    pub exclusion_tag: String,
    pub grace_period: Duration,
    pub assignee: Option<String>,
    pub dry_run: bool,
}

/// Maintains at most one open ticket per dormant account and advances each
/// through the grace-period state machine.
pub struct NotificationLifecycle {
    tracker: Arc<dyn TicketTracker>,
    finders: Vec<Box<dyn TicketFinder>>,
    removal: Option<Box<dyn RemovalHook>>,
    config: LifecycleConfig,
}

/// Per-bucket tally of one sweep. `removed` means the removal hook ran and
/// confirmed; a hook that ran and declined lands in `removal_declined`.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub notified: Vec<Ticket>,
    pub in_grace_period: Vec<String>,
    pub removed: Vec<String>,
    pub removal_declined: Vec<String>,
    pub reactivated: Vec<String>,
    pub excluded: Vec<String>,
    pub errors: Vec<SweepError>,
}

#[derive(Debug)]
pub struct SweepError {
    pub login: String,
    pub message: String,
}

enum Outcome {
    Notified(Ticket),
    InGracePeriod,
    Removed,
    RemovalDeclined,
    Excluded,
}

impl NotificationLifecycle {
    pub fn new(
        tracker: Arc<dyn TicketTracker>,
        finders: Vec<Box<dyn TicketFinder>>,
        removal: Option<Box<dyn RemovalHook>>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            tracker,
            finders,
            removal,
            config,
        }
    }

    /// Runs one sweep over the full current dormant set.
    ///
    /// Ticket lookup failing everywhere aborts the sweep; everything after
    /// that is isolated per account, so one account's tracker failure never
    /// blocks the rest.
    pub async fn process_dormant_accounts(
        &self,
        dormant: &[ActivityRecord],
    ) -> anyhow::Result<SweepReport> {
        let now = Utc::now();
        let filter = TicketFilter {
            title: None,
            tags: self.config.base_tags.clone(),
            assignee: self.config.assignee.clone(),
        };
        let open_tickets = find_open_tickets(&self.finders, &filter).await?;
        let dormant_logins: HashSet<&str> =
            dormant.iter().map(|rec| rec.login.as_str()).collect();

        let mut report = SweepReport::default();

        // Open tickets whose subject is no longer dormant: the account came
        // back before the grace period ran out.
        for ticket in &open_tickets {
            if dormant_logins.contains(ticket.subject_login.as_str()) {
                continue;
            }
            match self.reactivate(ticket).await {
                Ok(()) => report.reactivated.push(ticket.subject_login.clone()),
                Err(err) => report.errors.push(SweepError {
                    login: ticket.subject_login.clone(),
                    message: format!("{err:#}"),
                }),
            }
        }

        let by_login: HashMap<&str, &Ticket> = open_tickets
            .iter()
            .map(|ticket| (ticket.subject_login.as_str(), ticket))
            .collect();

        for rec in dormant {
            let ticket = by_login.get(rec.login.as_str()).copied();
            match self.advance(rec, ticket, now).await {
                Ok(Outcome::Notified(ticket)) => report.notified.push(ticket),
                Ok(Outcome::InGracePeriod) => report.in_grace_period.push(rec.login.clone()),
                Ok(Outcome::Removed) => report.removed.push(rec.login.clone()),
                Ok(Outcome::RemovalDeclined) => {
                    report.removal_declined.push(rec.login.clone())
                }
                Ok(Outcome::Excluded) => report.excluded.push(rec.login.clone()),
                Err(err) => report.errors.push(SweepError {
                    login: rec.login.clone(),
                    message: format!("{err:#}"),
                }),
            }
        }

        Ok(report)
    }

    async fn advance(
        &self,
        record: &ActivityRecord,
        ticket: Option<&Ticket>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Outcome> {
        let Some(ticket) = ticket else {
            return Ok(Outcome::Notified(self.notify(record, now).await?));
        };

        if ticket.has_tag(&self.config.exclusion_tag) {
            info!(login = %record.login, "excluded by admin tag, leaving ticket untouched");
            return Ok(Outcome::Excluded);
        }

        if now - ticket.created_at > self.config.grace_period {
            return self.expire(record, ticket).await;
        }

        Ok(Outcome::InGracePeriod)
    }

    async fn notify(
        &self,
        record: &ActivityRecord,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Ticket> {
        let mut tags = self.config.base_tags.clone();
        tags.push(PENDING_REMOVAL_TAG.to_string());

        if self.config.dry_run {
            info!(login = %record.login, "dry run: would open notification ticket");
            return Ok(Ticket {
                identifier: format!("dry-run-{}", Uuid::new_v4()),
                subject_login: record.login.clone(),
                created_at: now,
                open: true,
                tags,
                assignees: self.config.assignee.iter().cloned().collect(),
            });
        }

        let ticket = self
            .tracker
            .create(NewTicket {
                title: record.login.clone(),
                body: self.notification_body(record),
                tags,
                assignee: self.config.assignee.clone(),
            })
            .await?;
        info!(
            login = %record.login,
            ticket = %ticket.identifier,
            "opened dormancy notification"
        );
        Ok(ticket)
    }

    async fn expire(&self, record: &ActivityRecord, ticket: &Ticket) -> anyhow::Result<Outcome> {
        if self.config.dry_run {
            info!(login = %record.login, "dry run: would remove account after grace period");
            return Ok(Outcome::Removed);
        }

        let Some(hook) = self.removal.as_ref() else {
            warn!(login = %record.login, "grace period expired but no removal hook configured");
            return Ok(Outcome::RemovalDeclined);
        };

        if !hook.remove(record).await? {
            warn!(login = %record.login, "removal hook declined, ticket stays open");
            return Ok(Outcome::RemovalDeclined);
        }

        self.tracker.add_tag(ticket, REMOVED_TAG).await?;
        self.tracker
            .comment(ticket, "Account removed after the grace period expired.")
            .await?;
        self.tracker.close(ticket, Some("completed")).await?;
        info!(login = %record.login, "removed dormant account");
        Ok(Outcome::Removed)
    }

    async fn reactivate(&self, ticket: &Ticket) -> anyhow::Result<()> {
        if self.config.dry_run {
            info!(
                login = %ticket.subject_login,
                "dry run: would close ticket for reactivated account"
            );
            return Ok(());
        }

        self.tracker.add_tag(ticket, BECAME_ACTIVE_TAG).await?;
        self.tracker.remove_tag(ticket, PENDING_REMOVAL_TAG).await?;
        self.tracker.close(ticket, Some("completed")).await?;
        info!(login = %ticket.subject_login, "account reactivated, ticket closed");
        Ok(())
    }

    fn notification_body(&self, record: &ActivityRecord) -> String {
        let since = match record.last_activity {
            Some(ts) => format!("last recorded {} activity was {}", self.config.check, ts),
            None => format!("no {} activity has ever been recorded", self.config.check),
        };
        format!(
            "@{login}: {since}. The account will be removed once the grace period \
             of {days} days expires, unless activity resumes. Apply the `{exclusion}` \
             label to exempt it.",
            login = record.login,
            since = since,
            days = self.config.grace_period.num_days(),
            exclusion = self.config.exclusion_tag,
        )
    }
}
