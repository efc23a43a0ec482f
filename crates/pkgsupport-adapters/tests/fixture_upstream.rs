// Drives the fixture-backed upstream the way the sync pipeline does in offline mode.

use pkgsupport_adapters::{parse_community_feed, FixtureUpstream, Upstream};

fn fixtures_root() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

#[tokio::test]
async fn fixture_upstream_serves_every_feed() {
    let upstream = FixtureUpstream::new(fixtures_root());

    let manifest = upstream.dependency_manifest().await.expect("manifest");
    assert_eq!(manifest.len(), 2);

    let ranking = upstream.download_ranking().await.expect("ranking");
    assert_eq!(ranking.ranked_packages().len(), 3);

    let csv = upstream.community_feed().await.expect("community feed");
    let rows = parse_community_feed(&csv).expect("csv headers");
    assert_eq!(rows.len(), 6);
}

#[tokio::test]
async fn fixture_upstream_reports_unknown_packages_as_missing() {
    let upstream = FixtureUpstream::new(fixtures_root());

    let numpy = upstream.package_metadata("numpy").await.expect("numpy");
    assert_eq!(numpy.and_then(|m| m.info.version), Some("2.2.3".to_string()));

    let regex = upstream.package_metadata("regex").await.expect("regex");
    assert!(regex.is_none());
}
