use std::path::Path;

use chrono::NaiveDate;
use regvol_adapters::{
    snapshot_from_content, Catalog, FileCatalog, MarkupKind, RawContent,
};
use regvol_core::{CfrReference, FeatureSet};

fn fixtures_root() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

#[tokio::test]
async fn fixture_catalog_and_chapter_produce_stable_word_count() {
    let agencies = FileCatalog::new(fixtures_root().join("catalog/agencies.yaml"))
        .list_agencies()
        .await
        .expect("catalog");
    assert_eq!(agencies.len(), 2);
    assert_eq!(agencies[0].short_name.as_deref(), Some("FCA"));
    let reference = CfrReference::new(12).with_chapter("VI");
    assert_eq!(agencies[0].cfr_references[1], reference);

    let markup = std::fs::read_to_string(fixtures_root().join("ecfr/title-12-chapter-VI.xml"))
        .expect("fixture markup");
    let content = RawContent {
        markup,
        kind: MarkupKind::Xml,
        source_url: "fixture://title-12-chapter-VI".into(),
    };
    let date = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
    let snapshot = snapshot_from_content(&reference, date, &content).expect("snapshot");

    assert_eq!(
        snapshot.paragraphs,
        vec![
            "The Farm Credit Act of 1971, as amended, is the statutory authority for the Farm Credit System.",
            "(a) The Farm Credit Administration is an independent agency.",
            "Cross reference: see part 603.",
        ]
    );
    assert_eq!(FeatureSet::default().evaluate(&snapshot.paragraphs).word_count(), 31);
}
