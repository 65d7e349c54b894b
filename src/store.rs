use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::models::{ActivityRecord, CheckState};

/// Reserved key holding the [`CheckState`] inside the document.
pub const STATE_KEY: &str = "_state";

/// Durable keyed storage for activity records, backed by a single JSON file.
///
/// Every mutation rewrites the whole document: account keys sorted
/// lexicographically, `_state` restored to the front, `lastUpdated` stamped.
/// Mutations are serialized through an internal lock; the file itself carries
/// no lock, so two processes writing the same document race last-writer-wins.
pub struct ActivityStore {
    path: PathBuf,
    check: String,
    write_lock: Mutex<()>,
}

/// Stored shape of one account entry. The login is the map key and is not
/// duplicated into the value.
#[derive(Debug, Serialize, Deserialize)]
struct StoredAccount {
    #[serde(rename = "lastActivity")]
    last_activity: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    activity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<serde_json::Map<String, Value>>,
}

struct Document {
    state: CheckState,
    entries: BTreeMap<String, Value>,
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len() + 1))?;
        map.serialize_entry(STATE_KEY, &self.state)?;
        for (login, value) in &self.entries {
            map.serialize_entry(login, value)?;
        }
        map.end()
    }
}

impl ActivityStore {
    pub fn new(path: impl Into<PathBuf>, check: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            check: check.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn check(&self) -> &str {
        &self.check
    }

    /// Timestamp of the last completed fetch cycle, epoch if none yet.
    pub async fn get_last_run(&self) -> StoreResult<DateTime<Utc>> {
        Ok(self.load().await?.state.last_run)
    }

    pub async fn update_last_run(&self, timestamp: DateTime<Utc>) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await?;
        doc.state.last_run = timestamp;
        self.write(doc).await
    }

    /// Upserts one account keyed by login.
    pub async fn update_account(&self, record: &ActivityRecord) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await?;
        let stored = StoredAccount {
            last_activity: record.last_activity,
            activity_type: record.activity_type.clone(),
            metadata: record.metadata.clone(),
        };
        doc.entries
            .insert(record.login.clone(), serde_json::to_value(stored)?);
        self.write(doc).await
    }

    /// Deletes one account. Returns `false` without writing when the login is
    /// absent or names the reserved metadata key.
    pub async fn remove_account(&self, login: &str) -> StoreResult<bool> {
        if login == STATE_KEY {
            return Ok(false);
        }
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await?;
        if doc.entries.remove(login).is_none() {
            return Ok(false);
        }
        debug!(login, "removed account from state document");
        self.write(doc).await?;
        Ok(true)
    }

    /// All stored accounts with the login re-attached from the map key,
    /// ordered by login.
    pub async fn list_accounts(&self) -> StoreResult<Vec<ActivityRecord>> {
        let doc = self.load().await?;
        let mut accounts = Vec::with_capacity(doc.entries.len());
        for (login, value) in doc.entries {
            let stored: StoredAccount =
                serde_json::from_value(value).map_err(|err| StoreError::MalformedRecord {
                    key: login.clone(),
                    reason: err.to_string(),
                })?;
            accounts.push(ActivityRecord {
                login,
                last_activity: stored.last_activity,
                activity_type: stored.activity_type,
                metadata: stored.metadata,
            });
        }
        Ok(accounts)
    }

    /// Full-document snapshot for export and audit.
    pub async fn raw_document(&self) -> StoreResult<serde_json::Map<String, Value>> {
        let doc = self.load().await?;
        let mut map = serde_json::Map::with_capacity(doc.entries.len() + 1);
        map.insert(STATE_KEY.to_string(), serde_json::to_value(&doc.state)?);
        for (login, value) in doc.entries {
            map.insert(login, value);
        }
        Ok(map)
    }

    async fn load(&self) -> StoreResult<Document> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Document {
                    state: CheckState {
                        check_type: self.check.clone(),
                        ..CheckState::default()
                    },
                    entries: BTreeMap::new(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let root: serde_json::Map<String, Value> = serde_json::from_slice(&bytes)?;
        let mut state: Option<CheckState> = None;
        let mut entries = BTreeMap::new();
        for (key, value) in root {
            if key == STATE_KEY {
                state = Some(serde_json::from_value(value)?);
            } else {
                entries.insert(key, value);
            }
        }

        let mut state = state.unwrap_or_default();
        if state.check_type.is_empty() {
            state.check_type = self.check.clone();
        } else if state.check_type != self.check {
            return Err(StoreError::IdentityMismatch {
                expected: self.check.clone(),
                found: state.check_type,
            });
        }

        Ok(Document { state, entries })
    }

    async fn write(&self, mut doc: Document) -> StoreResult<()> {
        doc.state.last_updated = Utc::now();
        let bytes = serde_json::to_vec_pretty(&doc)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn record(login: &str, last_activity: Option<DateTime<Utc>>) -> ActivityRecord {
        ActivityRecord {
            login: login.to_string(),
            last_activity,
            activity_type: "copilot-seat".to_string(),
            metadata: None,
        }
    }

    fn store_at(dir: &TempDir, check: &str) -> ActivityStore {
        ActivityStore::new(dir.path().join("state.json"), check)
    }

    #[tokio::test]
    async fn last_run_defaults_to_epoch_for_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir, "copilot-seats");
        let last_run = store.get_last_run().await.unwrap();
        assert_eq!(last_run, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn upsert_then_list_reattaches_login() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir, "copilot-seats");
        let seen = Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap();

        store.update_account(&record("mona", Some(seen))).await.unwrap();
        store.update_account(&record("octocat", None)).await.unwrap();

        let accounts = store.list_accounts().await.unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].login, "mona");
        assert_eq!(accounts[0].last_activity, Some(seen));
        assert_eq!(accounts[1].login, "octocat");
        assert_eq!(accounts[1].last_activity, None);
    }

    #[tokio::test]
    async fn stored_value_does_not_duplicate_login() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir, "copilot-seats");
        store.update_account(&record("mona", None)).await.unwrap();

        let raw = store.raw_document().await.unwrap();
        let entry = raw.get("mona").unwrap().as_object().unwrap();
        assert!(!entry.contains_key("login"));
        assert!(entry.get("lastActivity").unwrap().is_null());
    }

    #[tokio::test]
    async fn remove_account_is_idempotent_and_spares_state_key() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir, "copilot-seats");
        store.update_account(&record("mona", None)).await.unwrap();

        assert!(store.remove_account("mona").await.unwrap());
        assert!(!store.remove_account("mona").await.unwrap());
        assert!(!store.remove_account(STATE_KEY).await.unwrap());
        assert!(store.list_accounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn document_keeps_state_first_and_logins_sorted() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir, "copilot-seats");
        for login in ["zeta", "0-day", "alpha"] {
            store.update_account(&record(login, None)).await.unwrap();
        }

        let text =
            std::fs::read_to_string(dir.path().join("state.json")).unwrap();
        let state_pos = text.find("\"_state\"").unwrap();
        let zero_pos = text.find("\"0-day\"").unwrap();
        let alpha_pos = text.find("\"alpha\"").unwrap();
        let zeta_pos = text.find("\"zeta\"").unwrap();
        assert!(state_pos < zero_pos);
        assert!(zero_pos < alpha_pos);
        assert!(alpha_pos < zeta_pos);
    }

    #[tokio::test]
    async fn mismatched_check_identity_is_fatal() {
        let dir = TempDir::new().unwrap();
        let writer = store_at(&dir, "copilot-seats");
        writer.update_account(&record("mona", None)).await.unwrap();

        let intruder = store_at(&dir, "audit-log");
        let err = intruder.get_last_run().await.unwrap_err();
        assert!(matches!(err, StoreError::IdentityMismatch { .. }));
        let err = intruder.update_account(&record("mona", None)).await.unwrap_err();
        assert!(matches!(err, StoreError::IdentityMismatch { .. }));
    }

    #[tokio::test]
    async fn malformed_entry_fails_listing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"_state":{"check-type":"copilot-seats"},"broken":42}"#,
        )
        .unwrap();

        let store = ActivityStore::new(path, "copilot-seats");
        let err = store.list_accounts().await.unwrap_err();
        match err {
            StoreError::MalformedRecord { key, .. } => assert_eq!(key, "broken"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn update_last_run_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir, "copilot-seats");
        let ts = Utc.with_ymd_and_hms(2026, 2, 14, 12, 0, 0).unwrap();
        store.update_last_run(ts).await.unwrap();
        assert_eq!(store.get_last_run().await.unwrap(), ts);
    }
}
