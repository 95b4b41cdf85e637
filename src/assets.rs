//! Asset boundary types and the snapshot-to-asset translator.
//!
//! These types are the crate's representation of the orchestration layer's
//! object model: an asset identity key plus a spec carrying dependencies and
//! metadata. A [`SigmaTranslator`] maps each crawled workbook and dataset to
//! that representation; the defs loader enforces that a translator's spec is
//! keyed by its own `asset_key` derivation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{OrganizationSnapshot, SigmaDataset, SigmaWorkbook};

/// Hierarchical identity of an asset, e.g. `sigma/workbook/revenue`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetKey(pub Vec<String>);

impl AssetKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// Specification of one asset derived from crawled Sigma metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetSpec {
    pub key: AssetKey,
    pub deps: BTreeSet<AssetKey>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Entity kind the spec was derived from: `workbook` or `dataset`.
    pub kind: String,
}

/// A crawled entity a translator derives an asset from.
#[derive(Debug, Clone, Copy)]
pub enum SigmaEntity<'a> {
    Workbook(&'a SigmaWorkbook),
    Dataset(&'a SigmaDataset),
}

/// Maps crawled entities to asset keys and specs.
///
/// Implementations must derive `asset_spec`'s key through `asset_key`; the
/// defs loader treats a mismatch as a programming error and panics.
pub trait SigmaTranslator {
    fn asset_key(&self, snapshot: &OrganizationSnapshot, entity: SigmaEntity<'_>) -> AssetKey;

    fn asset_spec(&self, snapshot: &OrganizationSnapshot, entity: SigmaEntity<'_>) -> AssetSpec;
}

/// Lowercases a display name and folds every non-alphanumeric run into a
/// single underscore, producing a stable asset path segment.
pub fn asset_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// The stock translator.
///
/// Workbooks depend on the datasets and tables their lineage reports;
/// datasets depend on their inferred upstream `catalog.db.table` inputs.
/// Dependencies on entities the snapshot does not include are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSigmaTranslator;

impl SigmaTranslator for DefaultSigmaTranslator {
    fn asset_key(&self, _snapshot: &OrganizationSnapshot, entity: SigmaEntity<'_>) -> AssetKey {
        match entity {
            SigmaEntity::Workbook(workbook) => AssetKey::new([
                "sigma",
                "workbook",
                asset_name(&workbook.properties.name).as_str(),
            ]),
            SigmaEntity::Dataset(dataset) => AssetKey::new([
                "sigma",
                "dataset",
                asset_name(&dataset.properties.name).as_str(),
            ]),
        }
    }

    fn asset_spec(&self, snapshot: &OrganizationSnapshot, entity: SigmaEntity<'_>) -> AssetSpec {
        let key = self.asset_key(snapshot, entity);
        match entity {
            SigmaEntity::Workbook(workbook) => {
                let mut deps = BTreeSet::new();
                for inode in &workbook.dataset_deps {
                    if let Some(dataset) = snapshot.dataset_by_inode(inode) {
                        deps.insert(self.asset_key(snapshot, SigmaEntity::Dataset(dataset)));
                    }
                }
                for inode in &workbook.direct_table_deps {
                    if let Some(table) = snapshot.table_by_inode(inode) {
                        if let Some(name) = &table.properties.name {
                            deps.insert(AssetKey::new(["sigma", "table", asset_name(name).as_str()]));
                        }
                    }
                }

                let mut metadata = BTreeMap::new();
                metadata.insert(
                    "url".to_string(),
                    serde_json::json!(workbook.properties.url),
                );
                metadata.insert(
                    "path".to_string(),
                    serde_json::json!(workbook.properties.path),
                );
                if let Some(version) = workbook.properties.latest_version {
                    metadata.insert("version".to_string(), serde_json::json!(version));
                }

                AssetSpec {
                    key,
                    deps,
                    metadata,
                    kind: "workbook".to_string(),
                }
            }
            SigmaEntity::Dataset(dataset) => {
                let deps = dataset
                    .inputs
                    .iter()
                    .map(|table| AssetKey::new(table.split('.')))
                    .collect();

                let mut metadata = BTreeMap::new();
                metadata.insert("url".to_string(), serde_json::json!(dataset.properties.url));
                if !dataset.columns.is_empty() {
                    metadata.insert(
                        "column_names".to_string(),
                        serde_json::json!(dataset.columns),
                    );
                }

                AssetSpec {
                    key,
                    deps,
                    metadata,
                    kind: "dataset".to_string(),
                }
            }
        }
    }
}
