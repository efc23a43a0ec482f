//! Build pipeline: official refresh, top-packages view, community updates, index.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pkgsupport_adapters::{
    parse_community_feed, Endpoints, FixtureUpstream, HttpUpstream, PackageMetadata, Upstream,
};
use pkgsupport_core::{
    apply_community_submission, apply_official_support, canonical_package_name,
    derive_top_packages, fold_manifest, format_timestamp, needs_summary_backfill,
    packages_missing_records, CommunitySubmission, PackageStatusRecord, RunCheckpoint, Status,
    NO_SUMMARY_PLACEHOLDER, NO_SUPPORT_DATA_NOTES,
};
use pkgsupport_storage::{HttpClientConfig, HttpFetcher, RecordStore};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pkgsupport-sync";

pub const SOURCES_FILE: &str = "sources.yaml";
pub const FIXTURES_DIR: &str = "fixtures";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Live,
    Fixtures,
}

impl SourceMode {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixture" | "fixtures" | "offline" => SourceMode::Fixtures,
            _ => SourceMode::Live,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub output_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub source_mode: SourceMode,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_concurrency: usize,
}

impl BuildConfig {
    pub fn from_env() -> Self {
        Self {
            output_dir: std::env::var("PKGSUPPORT_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./api")),
            workspace_root: std::env::var("PKGSUPPORT_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            source_mode: std::env::var("PKGSUPPORT_SOURCE_MODE")
                .map(|v| SourceMode::parse(&v))
                .unwrap_or(SourceMode::Live),
            user_agent: std::env::var("PKGSUPPORT_USER_AGENT")
                .unwrap_or_else(|_| "pkgsupport-bot/0.1".to_string()),
            http_timeout_secs: env_number("PKGSUPPORT_HTTP_TIMEOUT_SECS").unwrap_or(30),
            http_concurrency: env_number("PKGSUPPORT_HTTP_CONCURRENCY").unwrap_or(4),
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join(SOURCES_FILE)
    }

    pub fn fixtures_dir(&self) -> PathBuf {
        self.workspace_root.join(FIXTURES_DIR)
    }

    fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            concurrency: self.http_concurrency,
        }
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SourcesFile {
    #[serde(default)]
    endpoints: Endpoints,
}

/// Reads endpoint overrides from `sources.yaml`. A missing file means the
/// public defaults.
pub async fn load_endpoints(path: &Path) -> Result<Endpoints> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        return Ok(Endpoints::default());
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file: SourcesFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.endpoints)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OfficialStepSummary {
    pub manifest_packages: usize,
    pub written: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TopStepSummary {
    pub entries: usize,
    pub live_lookups: usize,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommunityStepSummary {
    pub rows: usize,
    pub applied: usize,
    pub already_processed: usize,
    pub rejected: usize,
    pub packages_written: usize,
    #[serde(with = "pkgsupport_core::iso8601")]
    pub checkpoint: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStepSummary {
    pub packages: usize,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub official: OfficialStepSummary,
    pub top: TopStepSummary,
    pub community: CommunityStepSummary,
    pub index: IndexStepSummary,
}

/// What the package detail page shows for one package.
#[derive(Debug, Clone, Serialize)]
pub struct PackageDetail {
    pub package_name: String,
    pub has_support_data: bool,
    pub status: Status,
    pub notes: String,
    pub supported_versions: BTreeMap<String, String>,
    pub summary: String,
    pub updated_by: String,
    pub updated_at: String,
    pub metadata: Option<PackageMetadata>,
}

impl PackageDetail {
    fn from_record(
        package_name: String,
        record: PackageStatusRecord,
        metadata: Option<PackageMetadata>,
    ) -> Self {
        Self {
            package_name,
            has_support_data: true,
            status: record.status,
            notes: record.notes,
            supported_versions: record.supported_versions,
            summary: record.summary,
            updated_by: record.updated_by,
            updated_at: format_timestamp(&record.updated_at),
            metadata,
        }
    }

    fn without_record(package_name: String, metadata: Option<PackageMetadata>) -> Self {
        let summary = metadata
            .as_ref()
            .and_then(|m| m.summary())
            .unwrap_or(NO_SUMMARY_PLACEHOLDER)
            .to_string();
        Self {
            package_name,
            has_support_data: false,
            status: Status::Amber,
            notes: NO_SUPPORT_DATA_NOTES.to_string(),
            supported_versions: BTreeMap::new(),
            summary,
            updated_by: "N/A".to_string(),
            updated_at: "N/A".to_string(),
            metadata,
        }
    }
}

pub struct BuildPipeline {
    upstream: Arc<dyn Upstream>,
    store: RecordStore,
}

impl BuildPipeline {
    pub fn new(upstream: Arc<dyn Upstream>, store: RecordStore) -> Self {
        Self { upstream, store }
    }

    pub async fn from_config(config: &BuildConfig) -> Result<Self> {
        let upstream: Arc<dyn Upstream> = match config.source_mode {
            SourceMode::Live => {
                let endpoints = load_endpoints(&config.sources_path()).await?;
                let http = HttpFetcher::new(config.http_client_config())?;
                Arc::new(HttpUpstream::new(http, endpoints))
            }
            SourceMode::Fixtures => Arc::new(FixtureUpstream::new(config.fixtures_dir())),
        };
        Ok(Self::new(upstream, RecordStore::new(config.output_dir.clone())))
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Runs every step in order: official refresh, top packages, community
    /// updates, index.
    pub async fn run_once(&self) -> Result<BuildRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("build_run", %run_id);

        async {
            let official = self.refresh_official(started_at).await?;
            let top = self.build_top_packages().await?;
            let community = self.apply_community_updates().await?;
            let index = self.rebuild_index().await?;

            Ok::<_, anyhow::Error>(BuildRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                official,
                top,
                community,
                index,
            })
        }
        .instrument(span)
        .await
    }

    /// Rewrites the record of every package in the dependency manifest.
    ///
    /// Packages whose metadata cannot be fetched are skipped.
    pub async fn refresh_official(&self, now: DateTime<Utc>) -> Result<OfficialStepSummary> {
        let manifest = self
            .upstream
            .dependency_manifest()
            .await
            .context("fetching dependency manifest")?;
        let packages = fold_manifest(&manifest);
        info!(
            releases = manifest.len(),
            packages = packages.len(),
            "generating per-package records from dependency manifest"
        );

        let mut summary = OfficialStepSummary {
            manifest_packages: packages.len(),
            ..Default::default()
        };
        let mut valid = BTreeMap::new();
        for (package_name, versions) in packages {
            match canonical_package_name(&package_name) {
                Ok(name) if name == package_name => {
                    valid.insert(package_name, versions);
                }
                _ => {
                    warn!(package = %package_name, "unusable package name in manifest; skipping");
                    summary.skipped += 1;
                }
            }
        }

        let mut metadata = self
            .lookup_metadata_many(valid.keys().cloned().collect())
            .await;

        for (package_name, versions) in valid {
            let Some(meta) = metadata.remove(&package_name).flatten() else {
                warn!(package = %package_name, "could not fetch PyPI metadata; skipping");
                summary.skipped += 1;
                continue;
            };
            let record = apply_official_support(&package_name, versions, meta.summary(), now)?;
            self.store.save_record(&package_name, &record).await?;
            summary.written += 1;
        }

        info!(
            written = summary.written,
            skipped = summary.skipped,
            "official support records written"
        );
        Ok(summary)
    }

    /// Writes the top-packages view from the download ranking and the
    /// records currently on disk.
    pub async fn build_top_packages(&self) -> Result<TopStepSummary> {
        let ranking = self
            .upstream
            .download_ranking()
            .await
            .context("fetching download ranking")?;
        let rows = ranking.ranked_packages();
        let records = self.store.load_all_records().await?;

        let missing = packages_missing_records(&rows, &records)
            .into_iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        let live_lookups = missing.len();
        let live_summaries = self
            .lookup_metadata_many(missing)
            .await
            .into_iter()
            .filter_map(|(name, meta)| {
                let summary = meta.as_ref()?.summary()?.to_string();
                Some((name, summary))
            })
            .collect::<HashMap<_, _>>();

        let top = derive_top_packages(
            ranking.last_update.as_deref(),
            &rows,
            &records,
            &live_summaries,
        );
        let path = self.store.save_top_packages(&top).await?;
        info!(
            entries = top.packages.len(),
            live_lookups,
            path = %path.display(),
            "top packages written"
        );

        Ok(TopStepSummary {
            entries: top.packages.len(),
            live_lookups,
            path: path.display().to_string(),
        })
    }

    /// Applies community submissions newer than the stored checkpoint, in
    /// feed order, then advances the checkpoint to the time the feed was
    /// fetched.
    ///
    /// Malformed rows are skipped. A record that cannot be read or written
    /// fails the pass before the checkpoint moves.
    pub async fn apply_community_updates(&self) -> Result<CommunityStepSummary> {
        let checkpoint = self.store.load_checkpoint().await?;
        let fetched_at = Utc::now();
        let csv = self
            .upstream
            .community_feed()
            .await
            .context("fetching community feed")?;
        let rows = parse_community_feed(&csv).context("parsing community feed")?;
        info!(
            rows = rows.len(),
            checkpoint = %format_timestamp(&checkpoint.last_run),
            "processing community status updates"
        );

        let mut rejected = 0usize;
        let mut already_processed = 0usize;
        let mut applied = 0usize;
        let mut written = BTreeSet::new();
        let total = rows.len();

        for row in rows {
            let submission = match row {
                Ok(submission) => submission,
                Err(err) => {
                    warn!(error = %err, "skipping community row");
                    rejected += 1;
                    continue;
                }
            };
            if !checkpoint.admits(submission.submitted_at) {
                debug!(package = %submission.package_name, "community row already processed");
                already_processed += 1;
                continue;
            }
            // A failed write leaves the checkpoint untouched so the row is retried.
            let outcome = self
                .apply_submission(&submission, &checkpoint)
                .await
                .with_context(|| {
                    format!("applying community update for {}", submission.package_name)
                })?;
            match outcome {
                Some(status) => {
                    info!(package = %submission.package_name, %status, "applied community update");
                    applied += 1;
                    written.insert(submission.package_name.clone());
                }
                None => already_processed += 1,
            }
        }

        let checkpoint = self.store.advance_checkpoint(fetched_at).await?;
        info!(
            applied,
            rejected,
            already_processed,
            last_run = %format_timestamp(&checkpoint.last_run),
            "recorded community checkpoint"
        );

        Ok(CommunityStepSummary {
            rows: total,
            applied,
            already_processed,
            rejected,
            packages_written: written.len(),
            checkpoint: checkpoint.last_run,
        })
    }

    async fn apply_submission(
        &self,
        submission: &CommunitySubmission,
        checkpoint: &RunCheckpoint,
    ) -> Result<Option<Status>> {
        let name = &submission.package_name;
        let current = self.store.load_record(name).await?;
        let backfill = if needs_summary_backfill(current.as_ref()) {
            self.lookup_metadata(name)
                .await
                .and_then(|m| m.summary().map(ToString::to_string))
        } else {
            None
        };
        let Some(record) = apply_community_submission(current, submission, checkpoint, backfill)
        else {
            return Ok(None);
        };
        self.store.save_record(name, &record).await?;
        Ok(Some(record.status))
    }

    /// Writes `all.json` from every record on disk.
    pub async fn rebuild_index(&self) -> Result<IndexStepSummary> {
        let records = self.store.load_all_records().await?;
        let path = self.store.save_index(&records).await?;
        info!(packages = records.len(), path = %path.display(), "package index written");
        Ok(IndexStepSummary {
            packages: records.len(),
            path: path.display().to_string(),
        })
    }

    /// Stored record plus live metadata for one package, or the amber
    /// placeholder when no record exists.
    pub async fn package_detail(&self, raw_name: &str) -> Result<PackageDetail> {
        let package_name = canonical_package_name(raw_name)?;
        let record = self.store.load_record(&package_name).await?;
        let metadata = self.lookup_metadata(&package_name).await;
        Ok(match record {
            Some(record) => PackageDetail::from_record(package_name, record, metadata),
            None => PackageDetail::without_record(package_name, metadata),
        })
    }

    async fn lookup_metadata(&self, package_name: &str) -> Option<PackageMetadata> {
        lookup_metadata_or_warn(self.upstream.as_ref(), package_name).await
    }

    /// Independent metadata lookups, fanned out. The HTTP fetcher bounds how
    /// many are in flight.
    async fn lookup_metadata_many(
        &self,
        package_names: Vec<String>,
    ) -> HashMap<String, Option<PackageMetadata>> {
        let mut tasks = JoinSet::new();
        for package_name in package_names {
            let upstream = Arc::clone(&self.upstream);
            tasks.spawn(async move {
                let metadata = lookup_metadata_or_warn(upstream.as_ref(), &package_name).await;
                (package_name, metadata)
            });
        }

        let mut out = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((package_name, metadata)) => {
                    out.insert(package_name, metadata);
                }
                Err(err) => warn!(error = %err, "metadata lookup task failed"),
            }
        }
        out
    }
}

async fn lookup_metadata_or_warn(upstream: &dyn Upstream, package_name: &str) -> Option<PackageMetadata> {
    match upstream.package_metadata(package_name).await {
        Ok(Some(metadata)) => Some(metadata),
        Ok(None) => {
            debug!(package = package_name, "package not found on PyPI");
            None
        }
        Err(err) => {
            warn!(package = package_name, error = %err, "PyPI metadata lookup failed");
            None
        }
    }
}

pub async fn run_build_once_from_env() -> Result<BuildRunSummary> {
    let config = BuildConfig::from_env();
    let pipeline = BuildPipeline::from_config(&config).await?;
    pipeline.run_once().await
}
