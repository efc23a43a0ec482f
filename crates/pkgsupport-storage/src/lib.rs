//! On-disk record store + HTTP fetch utilities for package support data.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use pkgsupport_core::{
    canonical_package_name, PackageStatusRecord, RunCheckpoint, TopPackagesSummary,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pkgsupport-storage";

pub const PACKAGE_DIR: &str = "package";
pub const TOP_PACKAGES_FILE: &str = "top_100_pypi_packages.json";
pub const INDEX_FILE: &str = "all.json";
pub const CHECKPOINT_FILE: &str = "last_run.json";

/// Serializes with four-space indentation, matching the published data files.
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    Ok(out)
}

/// JSON files under the output root:
///
/// ```text
/// <root>/package/<name>.json
/// <root>/top_100_pypi_packages.json
/// <root>/all.json
/// <root>/last_run.json
/// ```
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn package_dir(&self) -> PathBuf {
        self.root.join(PACKAGE_DIR)
    }

    pub fn record_path(&self, package_name: &str) -> anyhow::Result<PathBuf> {
        let name = canonical_package_name(package_name)
            .with_context(|| format!("resolving record path for {package_name:?}"))?;
        Ok(self.package_dir().join(format!("{name}.json")))
    }

    pub fn top_packages_path(&self) -> PathBuf {
        self.root.join(TOP_PACKAGES_FILE)
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.root.join(CHECKPOINT_FILE)
    }

    pub async fn load_record(&self, package_name: &str) -> anyhow::Result<Option<PackageStatusRecord>> {
        let path = self.record_path(package_name)?;
        read_json_if_exists(&path).await
    }

    pub async fn save_record(
        &self,
        package_name: &str,
        record: &PackageStatusRecord,
    ) -> anyhow::Result<PathBuf> {
        let path = self.record_path(package_name)?;
        write_json_atomic(&path, record).await?;
        debug!(package = package_name, path = %path.display(), status = %record.status, "wrote record");
        Ok(path)
    }

    /// Every persisted record keyed by file stem. A missing package
    /// directory yields an empty map.
    pub async fn load_all_records(&self) -> anyhow::Result<BTreeMap<String, PackageStatusRecord>> {
        let dir = self.package_dir();
        let mut records = BTreeMap::new();
        if !fs::try_exists(&dir)
            .await
            .with_context(|| format!("checking {}", dir.display()))?
        {
            return Ok(records);
        }

        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading {}", dir.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(package_name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let record: PackageStatusRecord = read_json(&path).await?;
            records.insert(package_name.to_string(), record);
        }
        Ok(records)
    }

    pub async fn save_top_packages(&self, summary: &TopPackagesSummary) -> anyhow::Result<PathBuf> {
        let path = self.top_packages_path();
        write_json_atomic(&path, summary).await?;
        Ok(path)
    }

    pub async fn load_top_packages(&self) -> anyhow::Result<Option<TopPackagesSummary>> {
        read_json_if_exists(&self.top_packages_path()).await
    }

    pub async fn save_index(
        &self,
        index: &BTreeMap<String, PackageStatusRecord>,
    ) -> anyhow::Result<PathBuf> {
        let path = self.index_path();
        write_json_atomic(&path, index).await?;
        Ok(path)
    }

    /// The stored checkpoint, or the first-run default when none exists.
    pub async fn load_checkpoint(&self) -> anyhow::Result<RunCheckpoint> {
        Ok(read_json_if_exists(&self.checkpoint_path())
            .await?
            .unwrap_or_default())
    }

    /// Moves the stored checkpoint forward to `now` and returns what was
    /// written. An older `now` leaves the stored value in place.
    pub async fn advance_checkpoint(&self, now: DateTime<Utc>) -> anyhow::Result<RunCheckpoint> {
        let checkpoint = self.load_checkpoint().await?.advance(now);
        write_json_atomic(&self.checkpoint_path(), &checkpoint).await?;
        Ok(checkpoint)
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn read_json_if_exists<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        return Ok(None);
    }
    read_json(path).await.map(Some)
}

/// Writes `value` as pretty JSON through a temp file + rename so readers
/// never observe a half-written file.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = to_pretty_json(value).with_context(|| format!("serializing {}", path.display()))?;
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shut down")]
    Closed,
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 404, .. })
    }
}

/// GET-only client shared by every source; the semaphore bounds in-flight
/// requests across the whole run. Each request is made once.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
        })
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let span = info_span!("http_fetch", source_id, url);
        self.fetch_once(url).instrument(span).await
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            debug!(%status, "non-success response");
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await.map_err(|source| FetchError::Request {
            url: final_url.clone(),
            source,
        })?;
        Ok(FetchedResponse {
            status,
            final_url,
            body: body.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkgsupport_core::{apply_official_support, parse_timestamp, Status, TopPackageEntry};
    use tempfile::tempdir;

    fn sample_record(summary: &str) -> PackageStatusRecord {
        apply_official_support(
            "numpy",
            BTreeMap::from([("0.25.0".to_string(), "1.26.4".to_string())]),
            Some(summary),
            parse_timestamp("2025-03-01T12:00:00Z").expect("ts"),
        )
        .expect("record")
    }

    #[tokio::test]
    async fn records_round_trip_through_package_dir() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());
        let record = sample_record("Fast array library");

        assert!(store.load_record("numpy").await.expect("load").is_none());
        let path = store.save_record("numpy", &record).await.expect("save");

        assert_eq!(path, dir.path().join("package").join("numpy.json"));
        assert_eq!(store.load_record("numpy").await.expect("load"), Some(record));
    }

    #[tokio::test]
    async fn written_json_uses_four_space_indent() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());
        let path = store
            .save_record("numpy", &sample_record("s"))
            .await
            .expect("save");
        let text = std::fs::read_to_string(path).expect("read");
        assert!(text.starts_with("{\n    \"status\": \"green\""));
        assert!(text.contains("\"updated_at\": \"2025-03-01T12:00:00+00:00\""));
    }

    #[tokio::test]
    async fn load_all_records_reads_only_json_files() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());
        assert!(store.load_all_records().await.expect("empty").is_empty());

        store.save_record("numpy", &sample_record("a")).await.expect("save");
        store.save_record("Pillow", &sample_record("b")).await.expect("save");
        std::fs::write(store.package_dir().join("README.txt"), "ignore me").expect("write");

        let all = store.load_all_records().await.expect("all");
        assert_eq!(all.keys().cloned().collect::<Vec<_>>(), vec!["Pillow", "numpy"]);
    }

    #[tokio::test]
    async fn checkpoint_defaults_then_only_advances() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());
        assert_eq!(store.load_checkpoint().await.expect("load"), RunCheckpoint::default());

        let later = parse_timestamp("2025-06-01T00:00:00Z").expect("ts");
        let earlier = parse_timestamp("2025-05-01T00:00:00Z").expect("ts");
        store.advance_checkpoint(later).await.expect("advance");
        let kept = store.advance_checkpoint(earlier).await.expect("advance");

        assert_eq!(kept.last_run, later);
        let raw = std::fs::read_to_string(store.checkpoint_path()).expect("read");
        assert!(raw.contains("\"last_run\": \"2025-06-01T00:00:00+00:00\""));
    }

    #[tokio::test]
    async fn top_packages_and_index_are_written_at_root() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());
        let summary = TopPackagesSummary {
            last_updated: "2025-03-01".into(),
            packages: vec![TopPackageEntry {
                package_name: "boto3".into(),
                downloads: 10,
                status: Status::Amber,
                summary: "AWS SDK".into(),
            }],
        };
        store.save_top_packages(&summary).await.expect("top");
        store
            .save_index(&BTreeMap::from([("numpy".to_string(), sample_record("x"))]))
            .await
            .expect("index");

        assert_eq!(store.load_top_packages().await.expect("load"), Some(summary));
        assert!(dir.path().join("all.json").exists());
    }

    #[test]
    fn record_path_rejects_traversal() {
        let store = RecordStore::new("/tmp/out");
        assert!(store.record_path("../secrets").is_err());
        assert!(store.record_path("").is_err());
        assert_eq!(
            store.record_path(" numpy ").expect("path"),
            PathBuf::from("/tmp/out/package/numpy.json")
        );
    }

    #[test]
    fn default_client_config_matches_documented_defaults() {
        let config = HttpClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.concurrency, 4);
        assert!(config.user_agent.is_none());
    }

    #[test]
    fn not_found_is_distinguished_from_other_statuses() {
        let missing = FetchError::HttpStatus {
            status: 404,
            url: "https://pypi.org/pypi/nope/json".into(),
        };
        let broken = FetchError::HttpStatus {
            status: 503,
            url: "https://pypi.org/pypi/numpy/json".into(),
        };
        assert!(missing.is_not_found());
        assert!(!broken.is_not_found());
    }
}
