//! Core domain model and status-merge rules for package support data.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pkgsupport-core";

pub const NO_SUMMARY_PLACEHOLDER: &str = "No summary available.";
pub const NO_SUPPORT_DATA_NOTES: &str =
    "No support data available. Please help us improve this by submitting feedback below.";
pub const UPDATED_BY_AUTOMATED: &str = "automated script";
pub const UPDATED_BY_COMMUNITY: &str = "Community contribution via Google Forms";
pub const UNKNOWN_LAST_UPDATED: &str = "unknown";
pub const TOP_PACKAGES_LIMIT: usize = 100;

/// `strftime` pattern of the community feed's `Timestamp` column.
pub const COMMUNITY_TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

/// 2025-01-01T00:00:00Z, the checkpoint assumed before the first community pass.
const FIRST_RUN_EPOCH_SECS: i64 = 1_735_689_600;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("package name must not be empty")]
    EmptyPackageName,
    #[error("invalid package name {0:?}")]
    InvalidPackageName(String),
}

/// Support status of a package in the browser runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Red,
    #[default]
    Amber,
    Green,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Red => "red",
            Status::Amber => "amber",
            Status::Green => "green",
        }
    }

    /// Collapses a free-text status suggestion into the three-value enum.
    ///
    /// Matching is a case-insensitive substring test: `red` wins over `green`,
    /// and anything mentioning neither is `amber`.
    pub fn from_suggestion(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("red") {
            Status::Red
        } else if lower.contains("green") {
            Status::Green
        } else {
            Status::Amber
        }
    }

    /// Reads a stored status value. Unknown values are amber.
    pub fn from_stored(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "red" => Status::Red,
            "green" => Status::Green,
            _ => Status::Amber,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(Status::from_stored).unwrap_or_default())
    }
}

/// Formats a timestamp as ISO-8601 with an explicit `+00:00` offset.
///
/// Sub-second precision is cut to microseconds and omitted when zero.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    let ts = ts.trunc_subsecs(6);
    let precision = if ts.timestamp_subsec_nanos() == 0 {
        SecondsFormat::Secs
    } else {
        SecondsFormat::Micros
    };
    ts.to_rfc3339_opts(precision, false)
}

/// Parses an ISO-8601 timestamp. Offset-less values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let raw = raw.trim();
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        Err(err) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| Utc.from_utc_datetime(&naive))
            .map_err(|_| err),
    }
}

/// Parses a community feed timestamp (`DD/MM/YYYY HH:MM:SS`, UTC).
pub fn parse_community_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(raw.trim(), COMMUNITY_TIMESTAMP_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Serde adapter for [`format_timestamp`] / [`parse_timestamp`].
pub mod iso8601 {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_timestamp(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Persisted support state for one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageStatusRecord {
    #[serde(default)]
    pub status: Status,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub notes: String,
    #[serde(default)]
    pub supported_versions: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub updated_by: String,
    #[serde(with = "iso8601")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub summary: String,
}

impl PackageStatusRecord {
    /// Starting point for a package first mentioned by a community submission.
    fn blank(updated_at: DateTime<Utc>) -> Self {
        Self {
            status: Status::Amber,
            notes: String::new(),
            supported_versions: BTreeMap::new(),
            updated_by: String::new(),
            updated_at,
            summary: String::new(),
        }
    }
}

/// Marks the last completed community pass. Never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    #[serde(with = "iso8601")]
    pub last_run: DateTime<Utc>,
}

impl Default for RunCheckpoint {
    fn default() -> Self {
        Self {
            last_run: DateTime::from_timestamp(FIRST_RUN_EPOCH_SECS, 0).unwrap_or_default(),
        }
    }
}

impl RunCheckpoint {
    pub fn new(last_run: DateTime<Utc>) -> Self {
        Self { last_run }
    }

    /// Whether a submission made at `ts` has not been applied yet.
    pub fn admits(&self, ts: DateTime<Utc>) -> bool {
        ts > self.last_run
    }

    pub fn advance(self, now: DateTime<Utc>) -> Self {
        Self {
            last_run: self.last_run.max(now),
        }
    }
}

/// One row of the community feed, already validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunitySubmission {
    pub submitted_at: DateTime<Utc>,
    pub package_name: String,
    pub suggested_status: String,
    pub notes: Option<String>,
}

impl CommunitySubmission {
    pub fn status(&self) -> Status {
        Status::from_suggestion(&self.suggested_status)
    }
}

/// release -> (package -> version), as published by the runtime.
pub type DependencyManifest = BTreeMap<String, BTreeMap<String, String>>;

/// Inverts the manifest into package -> (release -> version).
pub fn fold_manifest(manifest: &DependencyManifest) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut packages: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for (release, package_list) in manifest {
        for (package_name, version) in package_list {
            packages
                .entry(package_name.clone())
                .or_default()
                .insert(release.clone(), version.clone());
        }
    }
    packages
}

/// Trims an externally supplied package name and rejects values that cannot
/// name a record file.
pub fn canonical_package_name(raw: &str) -> Result<String, MergeError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(MergeError::EmptyPackageName);
    }
    if name == "." || name == ".." || name.contains(['/', '\\']) || name.contains('\0') {
        return Err(MergeError::InvalidPackageName(name.to_string()));
    }
    Ok(name.to_string())
}

/// Markdown explanation written into records built from the manifest.
pub fn official_notes(package_name: &str, supported_versions: &BTreeMap<String, String>) -> String {
    let mut notes = format!(
        r#"This package is [officially supported in Pyodide](https://pyodide.org/en/stable/usage/packages-in-pyodide.html).

To use it in PyScript simply add it to the `packages` section of your TOML configuration like this:

```
packages = ["{package_name}" ]
```

Or if you're using a JSON configuration, like this:

```
{{
    packages: ["{package_name}"]
 }}
```

Read more about using packages in PyScript [in our documentation](https://docs.pyscript.net/latest/user-guide/configuration/#packages).

Specifically, the following versions of the package are available for the following Pyodide releases:

Pyodide version: package name (version)
"#
    );
    let lines = supported_versions
        .iter()
        .rev()
        .map(|(release, version)| format!("* `{release}`: `{package_name} ({version})`"))
        .collect::<Vec<_>>();
    notes.push_str(&lines.join("\n"));
    notes
}

fn summary_or_placeholder(summary: Option<&str>) -> String {
    match summary {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => NO_SUMMARY_PLACEHOLDER.to_string(),
    }
}

/// Builds the record for a package listed in the runtime's dependency manifest.
///
/// Any previous record is replaced outright: officially bundled packages are
/// always green.
pub fn apply_official_support(
    package_name: &str,
    supported_versions: BTreeMap<String, String>,
    summary: Option<&str>,
    now: DateTime<Utc>,
) -> Result<PackageStatusRecord, MergeError> {
    if package_name.trim().is_empty() {
        return Err(MergeError::EmptyPackageName);
    }
    Ok(PackageStatusRecord {
        status: Status::Green,
        notes: official_notes(package_name, &supported_versions),
        supported_versions,
        updated_by: UPDATED_BY_AUTOMATED.to_string(),
        updated_at: now,
        summary: summary_or_placeholder(summary),
    })
}

/// Whether applying a submission to `current` would need a metadata lookup
/// to fill in the summary.
pub fn needs_summary_backfill(current: Option<&PackageStatusRecord>) -> bool {
    current.map_or(true, |record| record.summary.is_empty())
}

/// Applies one community submission on top of the current record.
///
/// Returns `None` when the submission is not newer than the checkpoint.
/// `backfilled_summary` is only used when the current summary is empty; a
/// failed lookup should be passed as `None` and leaves an empty summary.
pub fn apply_community_submission(
    current: Option<PackageStatusRecord>,
    submission: &CommunitySubmission,
    checkpoint: &RunCheckpoint,
    backfilled_summary: Option<String>,
) -> Option<PackageStatusRecord> {
    if !checkpoint.admits(submission.submitted_at) {
        return None;
    }
    let mut record =
        current.unwrap_or_else(|| PackageStatusRecord::blank(submission.submitted_at));
    if record.summary.is_empty() {
        record.summary = backfilled_summary.unwrap_or_default();
    }
    record.status = submission.status();
    if let Some(notes) = submission.notes.as_deref().filter(|n| !n.is_empty()) {
        record.notes = notes.to_string();
    }
    record.updated_by = UPDATED_BY_COMMUNITY.to_string();
    record.updated_at = submission.submitted_at;
    Some(record)
}

/// One `(project, download_count)` row of the download ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedPackage {
    pub project: String,
    pub download_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopPackageEntry {
    pub package_name: String,
    pub downloads: u64,
    pub status: Status,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopPackagesSummary {
    pub last_updated: String,
    pub packages: Vec<TopPackageEntry>,
}

/// The slice of the ranking that makes it into the top-packages view.
pub fn top_ranked(rows: &[RankedPackage]) -> &[RankedPackage] {
    &rows[..rows.len().min(TOP_PACKAGES_LIMIT)]
}

/// Top-ranked packages with no stored record, in rank order.
pub fn packages_missing_records<'a>(
    rows: &'a [RankedPackage],
    records: &BTreeMap<String, PackageStatusRecord>,
) -> Vec<&'a str> {
    top_ranked(rows)
        .iter()
        .filter(|row| !records.contains_key(&row.project))
        .map(|row| row.project.as_str())
        .collect()
}

/// Derives the top-packages view from the ranking and the stored records.
///
/// Packages without a record are amber; their summary comes from
/// `live_summaries` or falls back to the placeholder.
pub fn derive_top_packages(
    last_updated: Option<&str>,
    rows: &[RankedPackage],
    records: &BTreeMap<String, PackageStatusRecord>,
    live_summaries: &HashMap<String, String>,
) -> TopPackagesSummary {
    let packages = top_ranked(rows)
        .iter()
        .map(|row| {
            let (status, summary) = match records.get(&row.project) {
                Some(record) => (record.status, record.summary.clone()),
                None => (
                    Status::Amber,
                    summary_or_placeholder(live_summaries.get(&row.project).map(String::as_str)),
                ),
            };
            TopPackageEntry {
                package_name: row.project.clone(),
                downloads: row.download_count,
                status,
                summary,
            }
        })
        .collect();

    TopPackagesSummary {
        last_updated: last_updated.unwrap_or(UNKNOWN_LAST_UPDATED).to_string(),
        packages,
    }
}
