use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::models::ActivityRecord;
use crate::store::ActivityStore;

/// Check-scoped context handed to an [`ActivityFetcher`] for one cycle.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub last_fetch_time: DateTime<Utc>,
    pub check_identity: String,
    pub dry_run: bool,
}

/// Produces a fresh batch of activity records from the upstream source.
///
/// "No data" is an empty batch, not an error; an error aborts the whole
/// fetch cycle.
#[async_trait]
pub trait ActivityFetcher: Send + Sync {
    async fn fetch(&self, ctx: &FetchContext) -> anyhow::Result<Vec<ActivityRecord>>;
}

/// Per-record persistence step of a fetch cycle. Swappable to redirect
/// records somewhere other than the store.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    async fn record(&self, store: &ActivityStore, record: &ActivityRecord) -> anyhow::Result<()>;
}

/// Default sink: upsert into the state document.
pub struct StoreSink;

#[async_trait]
impl ActivitySink for StoreSink {
    async fn record(&self, store: &ActivityStore, record: &ActivityRecord) -> anyhow::Result<()> {
        store.update_account(record).await?;
        Ok(())
    }
}

#[async_trait]
pub trait DormancyPredicate: Send + Sync {
    async fn is_dormant(&self, record: &ActivityRecord, now: DateTime<Utc>)
        -> anyhow::Result<bool>;
}

/// Default dormancy rule: never-observed accounts are dormant, otherwise the
/// account is dormant iff its inactivity strictly exceeds the threshold.
pub struct ThresholdDormancy {
    threshold_ms: i64,
}

impl ThresholdDormancy {
    pub fn new(threshold: chrono::Duration) -> Self {
        Self {
            threshold_ms: threshold.num_milliseconds(),
        }
    }
}

#[async_trait]
impl DormancyPredicate for ThresholdDormancy {
    async fn is_dormant(
        &self,
        record: &ActivityRecord,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        match record.last_activity {
            None => {
                warn!(login = %record.login, "account has never been observed active");
                Ok(true)
            }
            Some(last) => Ok((now - last).num_milliseconds() > self.threshold_ms),
        }
    }
}

#[async_trait]
pub trait WhitelistPredicate: Send + Sync {
    async fn is_whitelisted(&self, record: &ActivityRecord) -> anyhow::Result<bool>;
}

/// Default whitelist: nobody is exempt.
pub struct NoWhitelist;

#[async_trait]
impl WhitelistPredicate for NoWhitelist {
    async fn is_whitelisted(&self, _record: &ActivityRecord) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Exempts an explicit set of logins.
pub struct LoginWhitelist {
    logins: HashSet<String>,
}

impl LoginWhitelist {
    pub fn new<I, S>(logins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            logins: logins.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl WhitelistPredicate for LoginWhitelist {
    async fn is_whitelisted(&self, record: &ActivityRecord) -> anyhow::Result<bool> {
        Ok(self.logins.contains(&record.login))
    }
}

/// De-provisions an account upstream. Returns whether the upstream actually
/// confirmed a removal; callers decide what a `false` means for reporting.
#[async_trait]
pub trait RemovalHook: Send + Sync {
    async fn remove(&self, record: &ActivityRecord) -> anyhow::Result<bool>;
}
