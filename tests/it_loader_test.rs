//! Integration tests for the defs loader adapter

use std::collections::{BTreeMap, BTreeSet};

use mockito::Matcher;
use sigma_datasets::model::{DatasetDocument, WorkbookDocument};
use sigma_datasets::{
    AssetKey, AssetSpec, DefaultSigmaTranslator, DefsSnapshot, Inode, OrganizationConfig,
    OrganizationSnapshot, SigmaDataset, SigmaDefsLoader, SigmaEntity, SigmaOrganization,
    SigmaTranslator, SigmaWorkbook,
};
use url::Url;

/// An organization pointing at a closed port; any attempted crawl fails.
fn offline_organization(client_id: &str) -> SigmaOrganization {
    let config = OrganizationConfig::new(
        Url::parse("http://127.0.0.1:9").expect("url is valid"),
        client_id,
        "secret-1",
    );
    SigmaOrganization::new(config).expect("organization builds")
}

fn sample_snapshot() -> OrganizationSnapshot {
    let workbook = SigmaWorkbook {
        properties: WorkbookDocument {
            workbook_id: "wb1".to_string(),
            name: "Revenue".to_string(),
            path: "Sales/Q1".to_string(),
            url: "https://app.sigmacomputing.com/org/workbook/wbu1".to_string(),
            latest_version: Some(3),
            created_by: None,
            extra: BTreeMap::new(),
        },
        dataset_deps: BTreeSet::from([Inode::from("inode-ds1")]),
        direct_table_deps: BTreeSet::new(),
        lineage: Vec::new(),
    };
    let dataset = SigmaDataset {
        properties: DatasetDocument {
            dataset_id: None,
            name: "Sales Numbers".to_string(),
            url: "https://app.sigmacomputing.com/org/dataset/ds1".to_string(),
            description: None,
            extra: BTreeMap::new(),
        },
        columns: BTreeSet::from(["col_a".to_string()]),
        inputs: BTreeSet::from(["catalog1.schema1.tableA".to_string()]),
    };
    OrganizationSnapshot {
        workbooks: vec![workbook],
        datasets: vec![dataset],
        tables: Vec::new(),
    }
}

#[test]
fn defs_key_is_derived_from_client_id() {
    let loader = SigmaDefsLoader::new(offline_organization("client-42"), DefaultSigmaTranslator);
    assert_eq!(loader.defs_key(), "sigma/client-42");
}

#[test]
fn supplied_snapshot_bypasses_the_crawl() {
    //* Given - a persisted snapshot containing this organization's key; the
    // API endpoint is unreachable, so any fetch attempt would error.
    let mut persisted = DefsSnapshot::default();
    persisted
        .insert("sigma/client-1", &sample_snapshot())
        .expect("snapshot serializes");

    let loader = SigmaDefsLoader::new(offline_organization("client-1"), DefaultSigmaTranslator)
        .with_snapshot(persisted);

    //* When
    let state = loader.fetch_state().expect("state restores from snapshot");
    let specs = loader.load_asset_specs().expect("specs load from snapshot");

    //* Then
    assert_eq!(state, sample_snapshot());
    let keys: Vec<String> = specs.iter().map(|s| s.key.to_string()).collect();
    assert_eq!(keys, ["sigma/workbook/revenue", "sigma/dataset/sales_numbers"]);

    // The workbook depends on its dataset; the dataset on its inferred
    // upstream table.
    assert!(specs[0]
        .deps
        .contains(&AssetKey::new(["sigma", "dataset", "sales_numbers"])));
    assert!(specs[1]
        .deps
        .contains(&AssetKey::new(["catalog1", "schema1", "tableA"])));
}

#[test]
fn snapshot_without_this_key_is_ignored() {
    //* Given - a snapshot for some other organization
    let mut persisted = DefsSnapshot::default();
    persisted
        .insert("sigma/other-org", &sample_snapshot())
        .expect("snapshot serializes");

    let loader = SigmaDefsLoader::new(offline_organization("client-1"), DefaultSigmaTranslator)
        .with_snapshot(persisted);

    //* When - the loader falls through to the crawl, which cannot reach the
    // API.
    let result = loader.fetch_state();

    //* Then
    assert!(result.is_err());
}

#[test]
fn defs_snapshot_round_trips_through_json() {
    let mut persisted = DefsSnapshot::default();
    persisted
        .insert("sigma/client-1", &sample_snapshot())
        .expect("snapshot serializes");

    let json = persisted.to_json().expect("snapshot serializes");
    let restored = DefsSnapshot::from_json(&json).expect("snapshot parses");
    assert_eq!(persisted, restored);
}

/// A translator that violates its own contract: the spec key disagrees with
/// the derived key.
struct MismatchedTranslator;

impl SigmaTranslator for MismatchedTranslator {
    fn asset_key(&self, snapshot: &OrganizationSnapshot, entity: SigmaEntity<'_>) -> AssetKey {
        DefaultSigmaTranslator.asset_key(snapshot, entity)
    }

    fn asset_spec(&self, snapshot: &OrganizationSnapshot, entity: SigmaEntity<'_>) -> AssetSpec {
        let mut spec = DefaultSigmaTranslator.asset_spec(snapshot, entity);
        spec.key = AssetKey::new(["sigma", "somewhere", "else"]);
        spec
    }
}

#[test]
#[should_panic(expected = "asset key mismatch")]
fn mismatched_translator_key_halts() {
    let mut persisted = DefsSnapshot::default();
    persisted
        .insert("sigma/client-1", &sample_snapshot())
        .expect("snapshot serializes");

    let loader = SigmaDefsLoader::new(offline_organization("client-1"), MismatchedTranslator)
        .with_snapshot(persisted);

    // Contract violation: must panic rather than silently substitute a key.
    let _ = loader.load_asset_specs();
}

#[test]
fn loader_runs_the_crawl_when_no_snapshot_is_supplied() {
    //* Given - a minimal live organization behind a mock server
    let mut server = mockito::Server::new();
    let mocks = vec![
        server
            .mock("POST", "/v2/auth/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "test-token"}"#)
            .expect(1)
            .create(),
        server
            .mock("GET", "/v2/workbooks")
            .match_query(Matcher::Exact("limit=1000".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"entries": [{
                    "workbookId": "wb1",
                    "name": "Revenue",
                    "path": "Sales/Q1",
                    "url": "https://app.sigmacomputing.com/org/workbook/wbu1"
                }]}"#,
            )
            .expect(1)
            .create(),
        server
            .mock("GET", "/v2/workbooks/wb1/pages")
            .match_query(Matcher::Exact("limit=1000".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"entries": [{"pageId": "p1"}]}"#)
            .expect(1)
            .create(),
        server
            .mock("GET", "/v2/workbooks/wb1/pages/p1/elements")
            .match_query(Matcher::Exact("limit=1000".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"entries": [{"elementId": "e1"}]}"#)
            .expect(1)
            .create(),
        server
            .mock("GET", "/v2/workbooks/wb1/lineage/elements/e1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"dependencies": {
                    "inode-ds1": {"nodeId": "inode-ds1", "type": "dataset"}
                }}"#,
            )
            .expect(1)
            .create(),
        server
            .mock("GET", "/v2/workbooks/wb1/queries")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"entries": [{"elementId": "e1", "sql": "SELECT a FROM cat.db.t"}]}"#,
            )
            .expect(1)
            .create(),
        server
            .mock("GET", "/v2/workbooks/wb1/elements/e1/columns")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"entries": [{"columnId": "inode-ds1/col_a"}]}"#)
            .expect(1)
            .create(),
        server
            .mock("GET", "/v2/datasets")
            .match_query(Matcher::Exact("limit=1000".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"entries": [{
                    "name": "Sales Numbers",
                    "url": "https://app.sigmacomputing.com/org/dataset/ds1"
                }]}"#,
            )
            .expect(1)
            .create(),
        server
            .mock("GET", "/v2/files")
            .match_query(Matcher::Exact("typeFilters=table&limit=1000".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"entries": []}"#)
            .expect(1)
            .create(),
    ];

    let config = OrganizationConfig::new(
        Url::parse(&server.url()).expect("server url is valid"),
        "client-1",
        "secret-1",
    );
    let organization = SigmaOrganization::new(config).expect("organization builds");
    let loader = SigmaDefsLoader::new(organization, DefaultSigmaTranslator);

    //* When - the loader blocks on the crawl internally
    let specs = loader.load_asset_specs().expect("specs load from the crawl");

    //* Then
    for mock in &mocks {
        mock.assert();
    }
    let keys: Vec<String> = specs.iter().map(|s| s.key.to_string()).collect();
    assert_eq!(keys, ["sigma/workbook/revenue", "sigma/dataset/sales_numbers"]);
    let dataset_spec = &specs[1];
    assert!(dataset_spec.deps.contains(&AssetKey::new(["cat", "db", "t"])));
    assert_eq!(
        dataset_spec.metadata["column_names"],
        serde_json::json!(["col_a"])
    );
}
