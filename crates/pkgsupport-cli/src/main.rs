use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use pkgsupport_sync::{BuildConfig, BuildPipeline, PackageDetail};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "pkgsupport")]
#[command(about = "Builds the PyScript package support JSON API")]
#[command(version = VERSION)]
struct Cli {
    /// Directory the API files are written to (overrides PKGSUPPORT_OUTPUT_DIR)
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every step: official, top, community, index
    Build,
    /// Regenerate records for packages bundled with Pyodide
    Official,
    /// Regenerate the top-100 PyPI packages view
    Top,
    /// Apply community submissions newer than the last run
    Community,
    /// Rewrite all.json from the stored records
    Index,
    /// Print the support detail for one package
    Show {
        package: String,
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "pkgsupport_sync=info,pkgsupport_storage=info,pkgsupport_adapters=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = BuildConfig::from_env();
    if let Some(output_dir) = cli.output_dir {
        config.output_dir = output_dir;
    }
    tracing::debug!(version = VERSION, ?config, "starting");
    let pipeline = BuildPipeline::from_config(&config).await?;

    match cli.command.unwrap_or(Commands::Build) {
        Commands::Build => {
            let summary = pipeline.run_once().await?;
            println!(
                "build complete: run_id={} official={} top={} community_applied={} indexed={}",
                summary.run_id,
                summary.official.written,
                summary.top.entries,
                summary.community.applied,
                summary.index.packages
            );
        }
        Commands::Official => {
            let summary = pipeline.refresh_official(Utc::now()).await?;
            println!(
                "official records: written={} skipped={}",
                summary.written, summary.skipped
            );
        }
        Commands::Top => {
            let summary = pipeline.build_top_packages().await?;
            println!("top packages: entries={} path={}", summary.entries, summary.path);
        }
        Commands::Community => {
            let summary = pipeline.apply_community_updates().await?;
            println!(
                "community updates: applied={} already_processed={} rejected={}",
                summary.applied, summary.already_processed, summary.rejected
            );
        }
        Commands::Index => {
            let summary = pipeline.rebuild_index().await?;
            println!("index: packages={} path={}", summary.packages, summary.path);
        }
        Commands::Show { package, json } => {
            let detail = pipeline.package_detail(&package).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&detail)?);
            } else {
                println!("{}", render_detail(&detail));
            }
        }
    }

    Ok(())
}

fn render_detail(detail: &PackageDetail) -> String {
    let mut lines = vec![
        format!("{} [{}]", detail.package_name, detail.status),
        format!("summary:    {}", detail.summary),
        format!("updated by: {}", detail.updated_by),
        format!("updated at: {}", detail.updated_at),
    ];
    if let Some(info) = detail.metadata.as_ref().map(|m| &m.info) {
        if let Some(version) = info.version.as_deref() {
            lines.push(format!("latest:     {version}"));
        }
        if let Some(author) = info.author.as_deref().filter(|a| !a.is_empty()) {
            lines.push(format!("author:     {author}"));
        }
        for (label, url) in info.project_urls.iter().flatten() {
            lines.push(format!("link:       {label}: {url}"));
        }
    }
    for (release, version) in detail.supported_versions.iter().rev() {
        lines.push(format!("  pyodide {release}: {version}"));
    }
    lines.push(String::new());
    lines.push(detail.notes.clone());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkgsupport_adapters::{PackageInfo, PackageMetadata};
    use pkgsupport_core::Status;
    use std::collections::BTreeMap;

    fn detail(metadata: Option<PackageMetadata>) -> PackageDetail {
        PackageDetail {
            package_name: "micropip".into(),
            has_support_data: true,
            status: Status::Green,
            notes: "bundled".into(),
            supported_versions: BTreeMap::from([
                ("0.26.4".to_string(), "0.6.0".to_string()),
                ("0.27.2".to_string(), "0.8.0".to_string()),
            ]),
            summary: "A lightweight Python package installer for the web".into(),
            updated_by: "automated script".into(),
            updated_at: "2025-03-01T12:00:00+00:00".into(),
            metadata,
        }
    }

    #[test]
    fn text_detail_lists_version_author_and_links() {
        let text = render_detail(&detail(Some(PackageMetadata {
            info: PackageInfo {
                author: Some("Pyodide developers".into()),
                version: Some("0.9.0".into()),
                project_urls: Some(BTreeMap::from([(
                    "Source".to_string(),
                    "https://github.com/pyodide/micropip".to_string(),
                )])),
                ..Default::default()
            },
        })));

        assert!(text.starts_with("micropip [green]\n"));
        assert!(text.contains("latest:     0.9.0"));
        assert!(text.contains("author:     Pyodide developers"));
        assert!(text.contains("link:       Source: https://github.com/pyodide/micropip"));
        assert!(text.find("pyodide 0.27.2").unwrap() < text.find("pyodide 0.26.4").unwrap());
        assert!(text.ends_with("\n\nbundled"));
    }

    #[test]
    fn text_detail_without_metadata_skips_registry_lines() {
        let text = render_detail(&detail(None));
        assert!(!text.contains("latest:"));
        assert!(!text.contains("author:"));
        assert!(!text.contains("link:"));
    }
}
