use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use crate::models::{AccountsSummary, ActivityRecord, ActivityTypeSummary, Classification};

pub fn summarize_by_type(
    accounts: &[ActivityRecord],
    dormant_logins: &HashSet<String>,
) -> Vec<ActivityTypeSummary> {
    let mut map: HashMap<String, (usize, usize)> = HashMap::new();

    for account in accounts {
        let entry = map.entry(account.activity_type.clone()).or_insert((0, 0));
        entry.0 += 1;
        if dormant_logins.contains(&account.login) {
            entry.1 += 1;
        }
    }

    let mut summaries: Vec<ActivityTypeSummary> = map
        .into_iter()
        .map(|(activity_type, (count, dormant_count))| ActivityTypeSummary {
            activity_type,
            count,
            dormant_count,
        })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count));
    summaries
}

pub fn build_report(
    check: &str,
    summary: &AccountsSummary,
    active: &[ActivityRecord],
    dormant: &[ActivityRecord],
) -> String {
    let dormant_logins: HashSet<String> =
        dormant.iter().map(|rec| rec.login.clone()).collect();
    let all: Vec<ActivityRecord> = active.iter().chain(dormant.iter()).cloned().collect();
    let mix = summarize_by_type(&all, &dormant_logins);

    let mut output = String::new();

    let _ = writeln!(output, "# Account Dormancy Report");
    let _ = writeln!(
        output,
        "Generated for check {} ({} day inactivity threshold)",
        check, summary.threshold_days
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Summary");
    let _ = writeln!(output, "- Last activity fetch: {}", summary.last_activity_fetch);
    let _ = writeln!(output, "- Total accounts: {}", summary.total_accounts);
    let _ = writeln!(
        output,
        "- Active: {} ({:.2}%)",
        summary.active_accounts, summary.active_account_percentage
    );
    let _ = writeln!(
        output,
        "- Dormant: {} ({:.2}%)",
        summary.dormant_accounts, summary.dormant_account_percentage
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Activity Mix");

    if mix.is_empty() {
        let _ = writeln!(output, "No accounts tracked yet.");
    } else {
        for entry in mix.iter() {
            let _ = writeln!(
                output,
                "- {}: {} accounts ({} dormant)",
                entry.activity_type, entry.count, entry.dormant_count
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Dormant Accounts");

    if dormant.is_empty() {
        let _ = writeln!(output, "No dormant accounts.");
    } else {
        for rec in dormant.iter() {
            let _ = writeln!(
                output,
                "- {}: last active {}",
                rec.login,
                rec.last_activity
                    .map(|ts| ts.to_string())
                    .unwrap_or_else(|| "never".to_string())
            );
        }
    }

    let mut recent = active.to_vec();
    recent.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Recently Active");

    if recent.is_empty() {
        let _ = writeln!(output, "No active accounts.");
    } else {
        for rec in recent.iter().take(5) {
            let _ = writeln!(
                output,
                "- {} ({}) last active {}",
                rec.login,
                rec.activity_type,
                rec.last_activity
                    .map(|ts| ts.to_string())
                    .unwrap_or_else(|| "never".to_string())
            );
        }
    }

    output
}

pub fn write_csv<W: std::io::Write>(
    writer: W,
    active: &[ActivityRecord],
    dormant: &[ActivityRecord],
) -> anyhow::Result<()> {
    #[derive(serde::Serialize)]
    struct CsvRow<'a> {
        login: &'a str,
        last_activity: String,
        activity_type: &'a str,
        classification: Classification,
    }

    let mut rows: Vec<(&ActivityRecord, Classification)> = active
        .iter()
        .map(|rec| (rec, Classification::Active))
        .chain(dormant.iter().map(|rec| (rec, Classification::Dormant)))
        .collect();
    rows.sort_by(|a, b| a.0.login.cmp(&b.0.login));

    let mut csv_writer = csv::Writer::from_writer(writer);
    for (rec, classification) in rows {
        csv_writer.serialize(CsvRow {
            login: &rec.login,
            last_activity: rec
                .last_activity
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_default(),
            activity_type: &rec.activity_type,
            classification,
        })?;
    }
    csv_writer.flush()?;
    Ok(())
}
