use std::collections::HashSet;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use clap::ValueEnum;
use futures::future::try_join_all;
use tracing::{info, warn};

use crate::models::{AccountsSummary, ActivityRecord};
use crate::policy::{
    ActivityFetcher, ActivitySink, DormancyPredicate, FetchContext, NoWhitelist, RemovalHook,
    StoreSink, ThresholdDormancy, WhitelistPredicate,
};
use crate::store::ActivityStore;

/// How a fetch batch relates to the upstream population.
///
/// A complete snapshot is the full current membership, so stored accounts
/// absent from it have disappeared upstream. A partial snapshot is an
/// incremental update; absence implies nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SnapshotMode {
    Partial,
    Complete,
}

/// Result of one fetch-and-merge cycle.
#[derive(Debug, Default)]
pub struct FetchCycle {
    pub merged: usize,
    pub removed: usize,
}

/// Classifies tracked accounts as active or dormant and runs the
/// fetch-and-merge cycle that keeps the store current.
pub struct DormancyEngine {
    store: ActivityStore,
    threshold: Duration,
    dry_run: bool,
    snapshot_mode: SnapshotMode,
    fetcher: Option<Box<dyn ActivityFetcher>>,
    sink: Box<dyn ActivitySink>,
    dormancy: Box<dyn DormancyPredicate>,
    whitelist: Box<dyn WhitelistPredicate>,
    removal: Option<Box<dyn RemovalHook>>,
}

impl DormancyEngine {
    pub fn new(
        store: ActivityStore,
        threshold: Duration,
        dry_run: bool,
        snapshot_mode: SnapshotMode,
    ) -> Self {
        Self {
            store,
            threshold,
            dry_run,
            snapshot_mode,
            fetcher: None,
            sink: Box::new(StoreSink),
            dormancy: Box::new(ThresholdDormancy::new(threshold)),
            whitelist: Box::new(NoWhitelist),
            removal: None,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Box<dyn ActivityFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn ActivitySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_dormancy(mut self, dormancy: Box<dyn DormancyPredicate>) -> Self {
        self.dormancy = dormancy;
        self
    }

    pub fn with_whitelist(mut self, whitelist: Box<dyn WhitelistPredicate>) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn with_removal_hook(mut self, hook: Box<dyn RemovalHook>) -> Self {
        self.removal = Some(hook);
        self
    }

    pub fn store(&self) -> &ActivityStore {
        &self.store
    }

    /// Runs one fetch-and-merge cycle.
    ///
    /// `lastRun` advances to the instant the cycle started, and only after
    /// every per-record write has landed, so a failed cycle retries the same
    /// window and a slow fetch loses no activity.
    pub async fn fetch_activity(
        &self,
        since_override: Option<DateTime<Utc>>,
    ) -> anyhow::Result<FetchCycle> {
        let fetcher = self
            .fetcher
            .as_ref()
            .context("no activity fetcher configured")?;

        let since = match since_override {
            Some(ts) => ts,
            None => self.store.get_last_run().await?,
        };
        let cycle_started = Utc::now();

        let ctx = FetchContext {
            last_fetch_time: since,
            check_identity: self.store.check().to_string(),
            dry_run: self.dry_run,
        };
        let batch = fetcher.fetch(&ctx).await?;
        info!(count = batch.len(), since = %since, "fetched activity batch");

        try_join_all(batch.iter().map(|rec| self.sink.record(&self.store, rec))).await?;

        let mut cycle = FetchCycle {
            merged: batch.len(),
            removed: 0,
        };

        if self.snapshot_mode == SnapshotMode::Complete {
            cycle.removed = self.reconcile_vanished(&batch).await?;
        }

        self.store.update_last_run(cycle_started).await?;
        Ok(cycle)
    }

    /// Complete-snapshot reconciliation: stored accounts absent from the
    /// batch have been de-provisioned upstream and are removed here too.
    async fn reconcile_vanished(&self, batch: &[ActivityRecord]) -> anyhow::Result<usize> {
        let fetched: HashSet<&str> = batch.iter().map(|rec| rec.login.as_str()).collect();
        let vanished: Vec<ActivityRecord> = self
            .store
            .list_accounts()
            .await?
            .into_iter()
            .filter(|rec| !fetched.contains(rec.login.as_str()))
            .collect();

        if vanished.is_empty() {
            return Ok(0);
        }

        let Some(hook) = self.removal.as_ref() else {
            warn!(
                count = vanished.len(),
                "no removal hook configured, vanished accounts retained"
            );
            return Ok(0);
        };

        let mut removed = 0;
        for rec in &vanished {
            if self.dry_run {
                info!(login = %rec.login, "dry run: would remove vanished account");
                continue;
            }
            hook.remove(rec).await?;
            self.store.remove_account(&rec.login).await?;
            removed += 1;
        }
        Ok(removed)
    }

    pub async fn list_accounts(&self) -> anyhow::Result<Vec<ActivityRecord>> {
        Ok(self.store.list_accounts().await?)
    }

    pub async fn list_active_accounts(&self) -> anyhow::Result<Vec<ActivityRecord>> {
        Ok(self.partition().await?.0)
    }

    pub async fn list_dormant_accounts(&self) -> anyhow::Result<Vec<ActivityRecord>> {
        Ok(self.partition().await?.1)
    }

    /// Splits all stored accounts into (active, dormant), both sorted by
    /// login. Classification is computed fresh on every call against a single
    /// `now` shared by the whole pass; a failing predicate aborts the pass.
    pub async fn partition(
        &self,
    ) -> anyhow::Result<(Vec<ActivityRecord>, Vec<ActivityRecord>)> {
        let accounts = self.store.list_accounts().await?;
        let now = Utc::now();

        let verdicts =
            try_join_all(accounts.into_iter().map(|rec| self.classify(rec, now))).await?;

        let mut active = Vec::new();
        let mut dormant = Vec::new();
        for (rec, is_dormant) in verdicts {
            if is_dormant {
                dormant.push(rec);
            } else {
                active.push(rec);
            }
        }
        active.sort_by(|a, b| a.login.cmp(&b.login));
        dormant.sort_by(|a, b| a.login.cmp(&b.login));
        Ok((active, dormant))
    }

    async fn classify(
        &self,
        record: ActivityRecord,
        now: DateTime<Utc>,
    ) -> anyhow::Result<(ActivityRecord, bool)> {
        if self.whitelist.is_whitelisted(&record).await? {
            return Ok((record, false));
        }
        let dormant = self.dormancy.is_dormant(&record, now).await?;
        Ok((record, dormant))
    }

    pub async fn summarize(&self) -> anyhow::Result<AccountsSummary> {
        let last_activity_fetch = self.store.get_last_run().await?;
        let (active, dormant) = self.partition().await?;
        let total = active.len() + dormant.len();

        let (active_pct, dormant_pct) = if total == 0 {
            (0.0, 0.0)
        } else {
            (
                round2(active.len() as f64 / total as f64 * 100.0),
                round2(dormant.len() as f64 / total as f64 * 100.0),
            )
        };

        Ok(AccountsSummary {
            last_activity_fetch,
            total_accounts: total,
            active_accounts: active.len(),
            dormant_accounts: dormant.len(),
            active_account_percentage: active_pct,
            dormant_account_percentage: dormant_pct,
            threshold_days: self.threshold.num_days(),
        })
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct StaticFetcher {
        batch: Vec<ActivityRecord>,
    }

    #[async_trait]
    impl ActivityFetcher for StaticFetcher {
        async fn fetch(&self, _ctx: &FetchContext) -> anyhow::Result<Vec<ActivityRecord>> {
            Ok(self.batch.clone())
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl ActivityFetcher for FailingFetcher {
        async fn fetch(&self, _ctx: &FetchContext) -> anyhow::Result<Vec<ActivityRecord>> {
            anyhow::bail!("upstream unavailable")
        }
    }

    struct RecordingHook {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl RemovalHook for RecordingHook {
        async fn remove(&self, record: &ActivityRecord) -> anyhow::Result<bool> {
            self.calls.lock().unwrap().push(record.login.clone());
            Ok(true)
        }
    }

    fn record(login: &str, last_activity: Option<DateTime<Utc>>) -> ActivityRecord {
        ActivityRecord {
            login: login.to_string(),
            last_activity,
            activity_type: "copilot-seat".to_string(),
            metadata: None,
        }
    }

    async fn seeded_store(dir: &TempDir, logins: &[&str]) -> ActivityStore {
        let store = ActivityStore::new(dir.path().join("state.json"), "copilot-seats");
        for login in logins {
            store
                .update_account(&record(login, Some(Utc::now())))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn complete_snapshot_removes_vanished_accounts() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir, &["a-user", "b-user", "c-user"]).await;
        let calls = Arc::new(Mutex::new(Vec::new()));

        let engine = DormancyEngine::new(
            store,
            Duration::days(30),
            false,
            SnapshotMode::Complete,
        )
        .with_fetcher(Box::new(StaticFetcher {
            batch: vec![record("a-user", Some(Utc::now()))],
        }))
        .with_removal_hook(Box::new(RecordingHook {
            calls: Arc::clone(&calls),
        }));

        let cycle = engine.fetch_activity(None).await.unwrap();
        assert_eq!(cycle.merged, 1);
        assert_eq!(cycle.removed, 2);

        let mut removed = calls.lock().unwrap().clone();
        removed.sort();
        assert_eq!(removed, vec!["b-user", "c-user"]);

        let logins: Vec<String> = engine
            .list_accounts()
            .await
            .unwrap()
            .into_iter()
            .map(|rec| rec.login)
            .collect();
        assert_eq!(logins, vec!["a-user"]);
    }

    #[tokio::test]
    async fn partial_snapshot_never_invokes_removal() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir, &["a-user", "b-user", "c-user"]).await;
        let calls = Arc::new(Mutex::new(Vec::new()));

        let engine = DormancyEngine::new(
            store,
            Duration::days(30),
            false,
            SnapshotMode::Partial,
        )
        .with_fetcher(Box::new(StaticFetcher {
            batch: vec![record("a-user", Some(Utc::now()))],
        }))
        .with_removal_hook(Box::new(RecordingHook {
            calls: Arc::clone(&calls),
        }));

        let cycle = engine.fetch_activity(None).await.unwrap();
        assert_eq!(cycle.removed, 0);
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(engine.list_accounts().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn dry_run_reconciliation_has_no_side_effects() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir, &["a-user", "b-user"]).await;
        let calls = Arc::new(Mutex::new(Vec::new()));

        let engine = DormancyEngine::new(
            store,
            Duration::days(30),
            true,
            SnapshotMode::Complete,
        )
        .with_fetcher(Box::new(StaticFetcher {
            batch: vec![record("a-user", Some(Utc::now()))],
        }))
        .with_removal_hook(Box::new(RecordingHook {
            calls: Arc::clone(&calls),
        }));

        engine.fetch_activity(None).await.unwrap();
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(engine.list_accounts().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_last_run_untouched() {
        let dir = TempDir::new().unwrap();
        let store = ActivityStore::new(dir.path().join("state.json"), "copilot-seats");
        let engine = DormancyEngine::new(
            store,
            Duration::days(30),
            false,
            SnapshotMode::Partial,
        )
        .with_fetcher(Box::new(FailingFetcher));

        assert!(engine.fetch_activity(None).await.is_err());
        let last_run = engine.store().get_last_run().await.unwrap();
        assert_eq!(last_run, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn whitelist_overrides_dormancy() {
        let dir = TempDir::new().unwrap();
        let store = ActivityStore::new(dir.path().join("state.json"), "copilot-seats");
        store.update_account(&record("ghost", None)).await.unwrap();

        let engine = DormancyEngine::new(
            store,
            Duration::days(30),
            false,
            SnapshotMode::Partial,
        )
        .with_whitelist(Box::new(crate::policy::LoginWhitelist::new(["ghost"])));

        let (active, dormant) = engine.partition().await.unwrap();
        assert_eq!(active.len(), 1);
        assert!(dormant.is_empty());
    }

    #[tokio::test]
    async fn partitions_are_sorted_by_login() {
        let dir = TempDir::new().unwrap();
        let store = ActivityStore::new(dir.path().join("state.json"), "copilot-seats");
        for login in ["zeta", "alpha", "mike"] {
            store
                .update_account(&record(login, Some(Utc::now())))
                .await
                .unwrap();
        }

        let engine = DormancyEngine::new(
            store,
            Duration::days(30),
            false,
            SnapshotMode::Partial,
        );
        let (active, _) = engine.partition().await.unwrap();
        let logins: Vec<&str> = active.iter().map(|rec| rec.login.as_str()).collect();
        assert_eq!(logins, vec!["alpha", "mike", "zeta"]);
    }

    #[tokio::test]
    async fn summary_of_empty_store_has_zero_percentages() {
        let dir = TempDir::new().unwrap();
        let store = ActivityStore::new(dir.path().join("state.json"), "copilot-seats");
        let engine = DormancyEngine::new(
            store,
            Duration::days(30),
            false,
            SnapshotMode::Partial,
        );

        let summary = engine.summarize().await.unwrap();
        assert_eq!(summary.total_accounts, 0);
        assert_eq!(summary.active_account_percentage, 0.0);
        assert_eq!(summary.dormant_account_percentage, 0.0);
    }

    #[tokio::test]
    async fn summary_percentages_cover_the_population() {
        let dir = TempDir::new().unwrap();
        let store = ActivityStore::new(dir.path().join("state.json"), "copilot-seats");
        store
            .update_account(&record("fresh", Some(Utc::now())))
            .await
            .unwrap();
        store
            .update_account(&record(
                "stale-1",
                Some(Utc::now() - Duration::days(90)),
            ))
            .await
            .unwrap();
        store.update_account(&record("stale-2", None)).await.unwrap();

        let engine = DormancyEngine::new(
            store,
            Duration::days(30),
            false,
            SnapshotMode::Partial,
        );
        let summary = engine.summarize().await.unwrap();
        assert_eq!(summary.total_accounts, 3);
        assert_eq!(summary.active_accounts, 1);
        assert_eq!(summary.dormant_accounts, 2);
        assert_eq!(summary.active_account_percentage, 33.33);
        assert_eq!(summary.dormant_account_percentage, 66.67);
        let sum = summary.active_account_percentage + summary.dormant_account_percentage;
        assert!((sum - 100.0).abs() < 0.011);
    }
}
