//! Upstream source contracts + parsers for the four data feeds.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use pkgsupport_core::{
    canonical_package_name, parse_community_timestamp, CommunitySubmission, DependencyManifest,
    RankedPackage, TOP_PACKAGES_LIMIT,
};
use pkgsupport_storage::{FetchError, HttpFetcher};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "pkgsupport-adapters";

pub const DEFAULT_MANIFEST_URL: &str =
    "https://raw.githubusercontent.com/pyscript/polyscript/refs/heads/main/rollup/pyodide_graph.json";
pub const DEFAULT_PYPI_BASE_URL: &str = "https://pypi.org/pypi";
pub const DEFAULT_RANKING_URL: &str =
    "https://hugovk.github.io/top-pypi-packages/top-pypi-packages.json";
pub const DEFAULT_COMMUNITY_CSV_URL: &str = "https://docs.google.com/spreadsheets/d/e/2PACX-1vQRcJ_Co69zrLdxbOi7b5zlO7fuqooypL5ejpVPe59YC1CPXHWA-MpLhJBpGJ44FkM0ewmwMo7yq27Z/pub?output=csv";

pub const COLUMN_TIMESTAMP: &str = "Timestamp";
pub const COLUMN_SUGGESTED_STATUS: &str = "Suggested status";
pub const COLUMN_PACKAGE_NAME: &str = "Package name (e.g. pandas, numba, my-cool-lib)";
pub const COLUMN_COMMENTS: &str = "Comments about status (Markdown allowed)";

pub const FIXTURE_MANIFEST_FILE: &str = "pyodide_graph.json";
pub const FIXTURE_PYPI_DIR: &str = "pypi";
pub const FIXTURE_RANKING_FILE: &str = "top-pypi-packages.json";
pub const FIXTURE_COMMUNITY_FILE: &str = "community.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    DependencyManifest,
    PackageMetadata,
    DownloadRanking,
    CommunityFeed,
}

impl SourceKind {
    pub fn source_id(&self) -> &'static str {
        match self {
            SourceKind::DependencyManifest => "dependency-manifest",
            SourceKind::PackageMetadata => "pypi-metadata",
            SourceKind::DownloadRanking => "download-ranking",
            SourceKind::CommunityFeed => "community-feed",
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching {}: {source}", .kind.source_id())]
    Fetch {
        kind: SourceKind,
        #[source]
        source: FetchError,
    },
    #[error("parsing {}: {message}", .kind.source_id())]
    Parse { kind: SourceKind, message: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    fn parse(kind: SourceKind, message: impl ToString) -> Self {
        AdapterError::Parse {
            kind,
            message: message.to_string(),
        }
    }
}

/// A community feed row that could not be turned into a submission. Only
/// that row is dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommunityRowError {
    #[error("row {row}: unparseable timestamp {value:?}")]
    Timestamp { row: usize, value: String },
    #[error("row {row}: missing package name")]
    MissingPackageName { row: usize },
    #[error("row {row}: invalid package name {value:?}")]
    InvalidPackageName { row: usize, value: String },
    #[error("row {row}: malformed CSV record: {message}")]
    Malformed { row: usize, message: String },
}

/// Where each feed lives. Deserialized from `sources.yaml`; missing keys
/// take the public defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    #[serde(default = "default_manifest_url")]
    pub manifest_url: String,
    #[serde(default = "default_pypi_base_url")]
    pub pypi_base_url: String,
    #[serde(default = "default_ranking_url")]
    pub ranking_url: String,
    #[serde(default = "default_community_csv_url")]
    pub community_csv_url: String,
}

fn default_manifest_url() -> String {
    DEFAULT_MANIFEST_URL.to_string()
}

fn default_pypi_base_url() -> String {
    DEFAULT_PYPI_BASE_URL.to_string()
}

fn default_ranking_url() -> String {
    DEFAULT_RANKING_URL.to_string()
}

fn default_community_csv_url() -> String {
    DEFAULT_COMMUNITY_CSV_URL.to_string()
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            manifest_url: default_manifest_url(),
            pypi_base_url: default_pypi_base_url(),
            ranking_url: default_ranking_url(),
            community_csv_url: default_community_csv_url(),
        }
    }
}

impl Endpoints {
    pub fn metadata_url(&self, package_name: &str) -> String {
        format!(
            "{}/{}/json",
            self.pypi_base_url.trim_end_matches('/'),
            package_name
        )
    }
}

/// The slice of the PyPI JSON API consumed here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadata {
    #[serde(default)]
    pub info: PackageInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub author_email: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub classifiers: Option<Vec<String>>,
    #[serde(default)]
    pub project_urls: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub version: Option<String>,
}

impl PackageMetadata {
    /// Non-empty summary, if PyPI has one.
    pub fn summary(&self) -> Option<&str> {
        self.info.summary.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRanking {
    #[serde(default)]
    pub last_update: Option<String>,
    #[serde(default)]
    pub rows: Vec<RankingRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingRow {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub download_count: Option<u64>,
}

impl DownloadRanking {
    /// The first [`TOP_PACKAGES_LIMIT`] rows in feed order. Rows without a
    /// project name are dropped after the cut; a missing download count is
    /// zero.
    pub fn ranked_packages(&self) -> Vec<RankedPackage> {
        self.rows
            .iter()
            .take(TOP_PACKAGES_LIMIT)
            .enumerate()
            .filter_map(|(idx, row)| match row.project.as_deref().map(str::trim) {
                Some(project) if !project.is_empty() => Some(RankedPackage {
                    project: project.to_string(),
                    download_count: row.download_count.unwrap_or(0),
                }),
                _ => {
                    warn!(rank = idx + 1, "ranking row without project name; skipping");
                    None
                }
            })
            .collect()
    }
}

fn parse_json<T: DeserializeOwned>(kind: SourceKind, bytes: &[u8]) -> Result<T, AdapterError> {
    serde_json::from_slice(bytes).map_err(|e| AdapterError::parse(kind, e))
}

pub fn parse_dependency_manifest(bytes: &[u8]) -> Result<DependencyManifest, AdapterError> {
    parse_json(SourceKind::DependencyManifest, bytes)
}

pub fn parse_package_metadata(bytes: &[u8]) -> Result<PackageMetadata, AdapterError> {
    parse_json(SourceKind::PackageMetadata, bytes)
}

pub fn parse_download_ranking(bytes: &[u8]) -> Result<DownloadRanking, AdapterError> {
    parse_json(SourceKind::DownloadRanking, bytes)
}

fn column_index(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim() == name)
}

/// Parses the published community CSV.
///
/// Missing required columns fail the whole feed; everything else is
/// reported per row so one bad submission never blocks the rest.
pub fn parse_community_feed(
    text: &str,
) -> Result<Vec<Result<CommunitySubmission, CommunityRowError>>, AdapterError> {
    let kind = SourceKind::CommunityFeed;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| AdapterError::parse(kind, e))?
        .clone();

    let timestamp_idx = column_index(&headers, COLUMN_TIMESTAMP)
        .ok_or_else(|| AdapterError::parse(kind, format!("missing column {COLUMN_TIMESTAMP:?}")))?;
    let package_idx = column_index(&headers, COLUMN_PACKAGE_NAME).ok_or_else(|| {
        AdapterError::parse(kind, format!("missing column {COLUMN_PACKAGE_NAME:?}"))
    })?;
    let status_idx = column_index(&headers, COLUMN_SUGGESTED_STATUS);
    let comments_idx = column_index(&headers, COLUMN_COMMENTS);

    let rows: Vec<_> = reader
        .records()
        .enumerate()
        .map(|(idx, record)| -> Result<CommunitySubmission, CommunityRowError> {
            let row = idx + 1;
            let record = record.map_err(|e| CommunityRowError::Malformed {
                row,
                message: e.to_string(),
            })?;
            let field = |i: Option<usize>| i.and_then(|i| record.get(i)).unwrap_or_default();

            let raw_timestamp = field(Some(timestamp_idx));
            let submitted_at = parse_community_timestamp(raw_timestamp).map_err(|_| {
                CommunityRowError::Timestamp {
                    row,
                    value: raw_timestamp.to_string(),
                }
            })?;

            let raw_name = field(Some(package_idx));
            if raw_name.trim().is_empty() {
                return Err(CommunityRowError::MissingPackageName { row });
            }
            let package_name =
                canonical_package_name(raw_name).map_err(|_| CommunityRowError::InvalidPackageName {
                    row,
                    value: raw_name.to_string(),
                })?;

            let notes = field(comments_idx);
            Ok(CommunitySubmission {
                submitted_at,
                package_name,
                suggested_status: field(status_idx).to_string(),
                notes: if notes.is_empty() {
                    None
                } else {
                    Some(notes.to_string())
                },
            })
        })
        .collect();

    Ok(rows)
}

/// The four upstream feeds.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn dependency_manifest(&self) -> Result<DependencyManifest, AdapterError>;

    /// `Ok(None)` when the registry has no usable entry for the package.
    async fn package_metadata(&self, package_name: &str)
        -> Result<Option<PackageMetadata>, AdapterError>;

    async fn download_ranking(&self) -> Result<DownloadRanking, AdapterError>;

    /// Raw CSV text of the community feed.
    async fn community_feed(&self) -> Result<String, AdapterError>;
}

#[derive(Debug)]
pub struct HttpUpstream {
    http: HttpFetcher,
    endpoints: Endpoints,
}

impl HttpUpstream {
    pub fn new(http: HttpFetcher, endpoints: Endpoints) -> Self {
        Self { http, endpoints }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    async fn fetch(&self, kind: SourceKind, url: &str) -> Result<Vec<u8>, AdapterError> {
        self.http
            .fetch_bytes(kind.source_id(), url)
            .await
            .map(|resp| resp.body)
            .map_err(|source| AdapterError::Fetch { kind, source })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn dependency_manifest(&self) -> Result<DependencyManifest, AdapterError> {
        let body = self
            .fetch(SourceKind::DependencyManifest, &self.endpoints.manifest_url)
            .await?;
        parse_dependency_manifest(&body)
    }

    async fn package_metadata(
        &self,
        package_name: &str,
    ) -> Result<Option<PackageMetadata>, AdapterError> {
        let kind = SourceKind::PackageMetadata;
        let url = self.endpoints.metadata_url(package_name);
        match self.http.fetch_bytes(kind.source_id(), &url).await {
            Ok(resp) => parse_package_metadata(&resp.body).map(Some),
            // Any non-success answer means "not on PyPI" for our purposes.
            Err(FetchError::HttpStatus { .. }) => Ok(None),
            Err(source) => Err(AdapterError::Fetch { kind, source }),
        }
    }

    async fn download_ranking(&self) -> Result<DownloadRanking, AdapterError> {
        let body = self
            .fetch(SourceKind::DownloadRanking, &self.endpoints.ranking_url)
            .await?;
        parse_download_ranking(&body)
    }

    async fn community_feed(&self) -> Result<String, AdapterError> {
        let body = self
            .fetch(SourceKind::CommunityFeed, &self.endpoints.community_csv_url)
            .await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Serves the feeds from a directory of captured files, for offline runs:
///
/// ```text
/// <root>/pyodide_graph.json
/// <root>/pypi/<name>.json
/// <root>/top-pypi-packages.json
/// <root>/community.csv
/// ```
#[derive(Debug, Clone)]
pub struct FixtureUpstream {
    root: PathBuf,
}

impl FixtureUpstream {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn read_fixture(path: &Path) -> anyhow::Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("reading fixture {}", path.display()))
}

#[async_trait]
impl Upstream for FixtureUpstream {
    async fn dependency_manifest(&self) -> Result<DependencyManifest, AdapterError> {
        parse_dependency_manifest(&read_fixture(&self.root.join(FIXTURE_MANIFEST_FILE))?)
    }

    async fn package_metadata(
        &self,
        package_name: &str,
    ) -> Result<Option<PackageMetadata>, AdapterError> {
        let path = self
            .root
            .join(FIXTURE_PYPI_DIR)
            .join(format!("{package_name}.json"));
        if !path.exists() {
            return Ok(None);
        }
        parse_package_metadata(&read_fixture(&path)?).map(Some)
    }

    async fn download_ranking(&self) -> Result<DownloadRanking, AdapterError> {
        parse_download_ranking(&read_fixture(&self.root.join(FIXTURE_RANKING_FILE))?)
    }

    async fn community_feed(&self) -> Result<String, AdapterError> {
        let bytes = read_fixture(&self.root.join(FIXTURE_COMMUNITY_FILE))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkgsupport_core::format_timestamp;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(name: &str) -> Vec<u8> {
        fs::read(workspace_root().join("fixtures").join(name)).expect("read fixture")
    }

    fn csv(rows: &[&str]) -> String {
        let mut text = format!(
            "{COLUMN_TIMESTAMP},{COLUMN_SUGGESTED_STATUS},\"{COLUMN_PACKAGE_NAME}\",\"{COLUMN_COMMENTS}\"\n"
        );
        for row in rows {
            text.push_str(row);
            text.push('\n');
        }
        text
    }

    #[test]
    fn manifest_fixture_parses_by_release() {
        let manifest = parse_dependency_manifest(&fixture(FIXTURE_MANIFEST_FILE)).unwrap();
        assert_eq!(manifest["0.27.2"]["numpy"], "2.0.2");
        assert!(manifest["0.26.4"].contains_key("regex"));
    }

    #[test]
    fn metadata_tolerates_nulls_and_missing_fields() {
        let meta = parse_package_metadata(
            br#"{"info": {"summary": "", "author": null, "classifiers": null, "version": "1.0"}}"#,
        )
        .unwrap();
        assert_eq!(meta.summary(), None);
        assert_eq!(meta.info.version.as_deref(), Some("1.0"));
        assert!(meta.info.project_urls.is_none());

        let bare = parse_package_metadata(b"{}").unwrap();
        assert_eq!(bare, PackageMetadata::default());
    }

    #[test]
    fn metadata_fixture_exposes_summary_and_urls() {
        let meta = parse_package_metadata(&fixture("pypi/numpy.json")).unwrap();
        assert_eq!(
            meta.summary(),
            Some("Fundamental package for array computing in Python")
        );
        assert!(meta
            .info
            .project_urls
            .as_ref()
            .is_some_and(|urls| urls.contains_key("Source")));
    }

    #[test]
    fn ranking_skips_rows_without_project() {
        let ranking = parse_download_ranking(&fixture(FIXTURE_RANKING_FILE)).unwrap();
        let ranked = ranking.ranked_packages();
        assert_eq!(ranking.last_update.as_deref(), Some("2025-03-01 07:32:20"));
        assert_eq!(ranking.rows.len(), 4);
        assert_eq!(
            ranked.iter().map(|r| r.project.as_str()).collect::<Vec<_>>(),
            vec!["boto3", "numpy", "urllib3"]
        );
        assert_eq!(ranked[2].download_count, 0);
    }

    #[test]
    fn ranking_is_cut_before_nameless_rows_are_dropped() {
        let mut rows = (1..=TOP_PACKAGES_LIMIT + 1)
            .map(|rank| RankingRow {
                project: Some(format!("pkg-{rank}")),
                download_count: Some(1_000 - rank as u64),
            })
            .collect::<Vec<_>>();
        rows[9].project = None;
        let ranking = DownloadRanking {
            last_update: None,
            rows,
        };

        let ranked = ranking.ranked_packages();

        assert_eq!(ranked.len(), TOP_PACKAGES_LIMIT - 1);
        assert_eq!(ranked.last().map(|r| r.project.as_str()), Some("pkg-100"));
        assert!(ranked.iter().all(|r| r.project != "pkg-10" && r.project != "pkg-101"));
    }

    #[test]
    fn malformed_feed_is_a_parse_error() {
        let err = parse_dependency_manifest(b"[1, 2, 3]").unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Parse { kind: SourceKind::DependencyManifest, .. }
        ));
    }

    #[test]
    fn community_rows_parse_with_utc_timestamps() {
        let rows = parse_community_feed(&csv(&[
            "15/03/2025 10:00:00,Looks Green to me,foo-pkg,works great",
        ]))
        .unwrap();
        let row = rows[0].as_ref().unwrap();
        assert_eq!(row.package_name, "foo-pkg");
        assert_eq!(row.suggested_status, "Looks Green to me");
        assert_eq!(row.notes.as_deref(), Some("works great"));
        assert_eq!(format_timestamp(&row.submitted_at), "2025-03-15T10:00:00+00:00");
    }

    #[test]
    fn bad_community_rows_are_reported_individually() {
        let rows = parse_community_feed(&csv(&[
            "yesterday,green,foo,",
            "15/03/2025 10:00:00,green,   ,",
            "15/03/2025 10:00:00,green,../evil,",
            "16/03/2025 10:00:00,red,\"  bar  \",",
        ]))
        .unwrap();

        assert_eq!(
            rows[0],
            Err(CommunityRowError::Timestamp {
                row: 1,
                value: "yesterday".into()
            })
        );
        assert_eq!(rows[1], Err(CommunityRowError::MissingPackageName { row: 2 }));
        assert!(matches!(
            rows[2],
            Err(CommunityRowError::InvalidPackageName { row: 3, .. })
        ));
        let ok = rows[3].as_ref().unwrap();
        assert_eq!(ok.package_name, "bar");
        assert_eq!(ok.notes, None);
    }

    #[test]
    fn community_feed_without_required_columns_is_rejected() {
        let err = parse_community_feed("When,What\n15/03/2025 10:00:00,green\n").unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Parse { kind: SourceKind::CommunityFeed, .. }
        ));
    }

    #[test]
    fn community_fixture_keeps_feed_order() {
        let text = String::from_utf8(fixture(FIXTURE_COMMUNITY_FILE)).unwrap();
        let rows = parse_community_feed(&text).unwrap();
        let names = rows
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|r| r.package_name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["foo-pkg", "numpy", "micropip", "foo-pkg"]);
        assert_eq!(rows.iter().filter(|r| r.is_err()).count(), 2);
    }

    #[test]
    fn metadata_url_joins_base_and_name() {
        let endpoints = Endpoints {
            pypi_base_url: "http://localhost:8080/pypi/".into(),
            ..Endpoints::default()
        };
        assert_eq!(
            endpoints.metadata_url("numpy"),
            "http://localhost:8080/pypi/numpy/json"
        );
        assert_eq!(
            Endpoints::default().metadata_url("numpy"),
            "https://pypi.org/pypi/numpy/json"
        );
    }

    #[test]
    fn endpoints_fill_missing_keys_with_defaults() {
        let endpoints: Endpoints =
            serde_json::from_str(r#"{"ranking_url": "http://mirror/top.json"}"#).unwrap();
        assert_eq!(endpoints.ranking_url, "http://mirror/top.json");
        assert_eq!(endpoints.manifest_url, DEFAULT_MANIFEST_URL);
    }
}
