//! Typed records for Sigma API payloads and the crawled organization model.
//!
//! Wire documents keep their known fields as named, typed struct members and
//! collect everything else into a flattened `extra` map, so raw API
//! properties survive the round-trip into a persisted snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Stable identifier for a dataset or table, derived from its API-provided
/// URL. Lineage responses report upstream nodes by the same identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Inode(String);

impl Inode {
    /// Derives the inode from an entity URL: the last `/`-separated segment,
    /// prefixed with `inode-`. An input without slashes (e.g. a bare
    /// `urlId`) is used whole.
    pub fn from_url(url: &str) -> Self {
        Self(format!("inode-{}", url.rsplit('/').next().unwrap_or(url)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Inode {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Inode {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page of a paginated list response.
///
/// The API signals continuation through `hasMore`, which arrives either as a
/// boolean or as the strings `"true"`/`"True"`, and a `nextPage` cursor that
/// may be a string or a number. Anything else means the listing is complete.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Paginated<T> {
    #[serde(default = "Vec::new")]
    pub entries: Vec<T>,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub has_more: bool,
    #[serde(default, deserialize_with = "flexible_cursor")]
    pub next_page: Option<String>,
}

fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    Ok(match Option::<Flag>::deserialize(deserializer)? {
        Some(Flag::Bool(b)) => b,
        Some(Flag::Text(s)) => matches!(s.as_str(), "true" | "True"),
        None => false,
    })
}

fn flexible_cursor<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Cursor {
        Text(String),
        Number(i64),
    }

    Ok(Option::<Cursor>::deserialize(deserializer)?.map(|c| match c {
        Cursor::Text(s) => s,
        Cursor::Number(n) => n.to_string(),
    }))
}

/// Raw workbook listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkbookDocument {
    pub workbook_id: String,
    pub name: String,
    /// Folder path of the workbook, `/`-separated from the root folder.
    pub path: String,
    pub url: String,
    #[serde(default)]
    pub latest_version: Option<u64>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Raw dataset listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetDocument {
    #[serde(default)]
    pub dataset_id: Option<String>,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl DatasetDocument {
    pub fn inode(&self) -> Inode {
        Inode::from_url(&self.url)
    }
}

/// Raw table listing entry from the `files` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDocument {
    pub url_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl TableDocument {
    pub fn inode(&self) -> Inode {
        Inode::from_url(&self.url_id)
    }
}

/// A page of a workbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageDocument {
    pub page_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A visual or query element on a workbook page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDocument {
    pub element_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A column referenced by a workbook element.
///
/// `column_id` encodes the owning dataset: identifiers of the form
/// `<inode>/<column name>` attribute the column to that dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDocument {
    pub column_id: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A query backing a workbook element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDocument {
    pub element_id: String,
    pub sql: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A member of the Sigma organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberDocument {
    pub member_id: String,
    pub email: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// An upstream node reported by element lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageNode {
    pub node_id: String,
    /// `dataset`, `table`, or another node kind.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl LineageNode {
    pub fn is_dataset(&self) -> bool {
        self.kind.as_deref() == Some("dataset")
    }

    pub fn is_table(&self) -> bool {
        self.kind.as_deref() == Some("table")
    }
}

/// Lineage payload for one workbook element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementLineage {
    /// Upstream dependencies keyed by node id.
    #[serde(default)]
    pub dependencies: BTreeMap<String, LineageNode>,
}

/// A workbook with its crawled dependency information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigmaWorkbook {
    pub properties: WorkbookDocument,
    /// Inodes of every dataset-typed lineage dependency across all elements.
    pub dataset_deps: BTreeSet<Inode>,
    /// Inodes of every table-typed lineage dependency across all elements.
    pub direct_table_deps: BTreeSet<Inode>,
    /// Per-element lineage payloads, in element order.
    pub lineage: Vec<ElementLineage>,
}

/// A dataset with its inferred columns and upstream tables.
///
/// Both sets are best-effort: columns are only discovered through workbook
/// elements that reference them, and inputs only through queries attributed
/// unambiguously to this dataset. Absence proves nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigmaDataset {
    pub properties: DatasetDocument,
    pub columns: BTreeSet<String>,
    /// Qualified `catalog.schema.table` names this dataset reads from.
    pub inputs: BTreeSet<String>,
}

impl SigmaDataset {
    pub fn inode(&self) -> Inode {
        self.properties.inode()
    }
}

/// A warehouse table referenced directly by some workbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigmaTable {
    pub properties: TableDocument,
}

impl SigmaTable {
    pub fn inode(&self) -> Inode {
        self.properties.inode()
    }
}

/// The complete, point-in-time aggregate produced by one crawl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationSnapshot {
    pub workbooks: Vec<SigmaWorkbook>,
    pub datasets: Vec<SigmaDataset>,
    pub tables: Vec<SigmaTable>,
}

impl OrganizationSnapshot {
    pub fn dataset_by_inode(&self, inode: &Inode) -> Option<&SigmaDataset> {
        self.datasets.iter().find(|d| &d.inode() == inode)
    }

    pub fn table_by_inode(&self, inode: &Inode) -> Option<&SigmaTable> {
        self.tables.iter().find(|t| &t.inode() == inode)
    }
}
