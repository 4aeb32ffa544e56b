use std::fs;

use assert_matches::assert_matches;
use tempfile::tempdir;

use seqr_reconcile::config::{ConfigLoader, IngestionTarget, ProvisionPolicy};
use seqr_reconcile::error::ReconcileError;
use seqr_reconcile::resolver::FuzzyEligibility;

#[test]
fn explicit_config_file_is_resolved() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("seqr-reconcile.json");
    fs::write(
        &path,
        r#"{
  "schema_version": 1,
  "store_path": "/var/lib/seqr/records.json",
  "max_edit_distance": 2,
  "fuzzy_eligibility": "without-sample-of-type",
  "provision": "no",
  "ingestion": { "webhook": "https://loader.example.org/datasets" }
}"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();

    assert_eq!(resolved.store_path.as_str(), "/var/lib/seqr/records.json");
    assert_eq!(resolved.max_edit_distance, 2);
    assert_eq!(resolved.fuzzy_eligibility, FuzzyEligibility::WithoutSampleOfType);
    assert_eq!(resolved.provision, ProvisionPolicy::No);
    assert_eq!(
        resolved.ingestion,
        IngestionTarget::Webhook("https://loader.example.org/datasets".to_string())
    );
}

#[test]
fn explicit_config_must_exist() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("missing.json");

    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(ReconcileError::ConfigRead(_))
    );
}

#[test]
fn malformed_config_is_a_parse_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("seqr-reconcile.json");
    fs::write(&path, r#"{ "max_edit_distance": "two" }"#).unwrap();

    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(ReconcileError::ConfigParse(_))
    );
}

#[test]
fn future_schema_version_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("seqr-reconcile.json");
    fs::write(&path, r#"{ "schema_version": 2 }"#).unwrap();

    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(ReconcileError::ConfigParse(msg)) if msg.contains("schema_version")
    );
}
