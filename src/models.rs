use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One tracked account's most recently observed activity.
///
/// `login` is the primary key within a single state document; everything else
/// is payload. `last_activity` of `None` means the account has never been
/// observed active by this check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub login: String,
    #[serde(rename = "lastActivity")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub activity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Singleton metadata slot of a state document.
///
/// `check_type` stamps which logical check owns the document; a document
/// stamped for another check must never be served.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckState {
    #[serde(rename = "lastRun", default = "unix_epoch")]
    pub last_run: DateTime<Utc>,
    #[serde(rename = "check-type", default)]
    pub check_type: String,
    #[serde(rename = "lastUpdated", default = "unix_epoch")]
    pub last_updated: DateTime<Utc>,
}

impl Default for CheckState {
    fn default() -> Self {
        Self {
            last_run: unix_epoch(),
            check_type: String::new(),
            last_updated: unix_epoch(),
        }
    }
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Which side of the inactivity threshold an account fell on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Active,
    Dormant,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Classification::Active => f.write_str("active"),
            Classification::Dormant => f.write_str("dormant"),
        }
    }
}

/// Aggregate view over one classification pass.
#[derive(Debug, Clone, Serialize)]
pub struct AccountsSummary {
    pub last_activity_fetch: DateTime<Utc>,
    pub total_accounts: usize,
    pub active_accounts: usize,
    pub dormant_accounts: usize,
    pub active_account_percentage: f64,
    pub dormant_account_percentage: f64,
    pub threshold_days: i64,
}

#[derive(Debug, Clone)]
pub struct ActivityTypeSummary {
    pub activity_type: String,
    pub count: usize,
    pub dormant_count: usize,
}
