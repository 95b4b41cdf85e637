//! Sigma metadata extractor.
//!
//! This crate connects to a Sigma organization via the Sigma REST API, crawls
//! its business-intelligence metadata (workbooks, pages, elements, datasets,
//! tables), infers dataset-to-table lineage from the SQL embedded in workbook
//! queries, and assembles an immutable organization-wide snapshot. A defs
//! loader translates the snapshot into asset specs for an orchestration
//! layer.
//!
//! ## Crawl shape
//!
//! ```text
//! loader ──► organization snapshot builder
//!               ├─► lineage inference   (workbook → pages → elements → lineage + queries)
//!               └─► column inference    (workbook → pages → elements → columns)
//!                        │
//!                        ▼
//!               memoized fetch layer (single-flight per endpoint + args)
//!                        │
//!                        ▼
//!               authenticated HTTP client ──► Sigma REST API
//! ```
//!
//! All fetches are issued concurrently and awaited jointly wherever the API
//! allows it; pagination within one endpoint is strictly sequential since
//! each page cursor depends on the previous response. Every distinct
//! (endpoint, arguments) pair is resolved by at most one network call per
//! [`SigmaOrganization`] value, even under concurrent callers.

use serde::Deserialize;
use serde_with::serde_as;
use url::Url;

pub mod assets;
mod cache;
mod client;
pub mod error;
mod lineage;
mod loader;
pub mod model;
mod organization;

pub use self::{
    assets::{AssetKey, AssetSpec, DefaultSigmaTranslator, SigmaEntity, SigmaTranslator},
    client::SigmaOrganization,
    error::{Error, Result},
    loader::{DefsSnapshot, SigmaDefsLoader, DEFS_KEY_PREFIX},
    model::{Inode, OrganizationSnapshot, SigmaDataset, SigmaTable, SigmaWorkbook},
};

/// Sigma API base URLs per cloud deployment region.
///
/// The base URL for an organization is listed under
/// Administration → Account → Site settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigmaBaseUrl {
    AwsUs,
    AwsCanada,
    AwsEurope,
    AwsUk,
    AzureUs,
    Gcp,
}

impl SigmaBaseUrl {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigmaBaseUrl::AwsUs => "https://aws-api.sigmacomputing.com",
            SigmaBaseUrl::AwsCanada => "https://api.ca.aws.sigmacomputing.com",
            SigmaBaseUrl::AwsEurope => "https://api.eu.aws.sigmacomputing.com",
            SigmaBaseUrl::AwsUk => "https://api.uk.aws.sigmacomputing.com",
            SigmaBaseUrl::AzureUs => "https://api.us.azure.sigmacomputing.com",
            SigmaBaseUrl::Gcp => "https://api.sigmacomputing.com",
        }
    }

    pub fn url(&self) -> Url {
        self.as_str().parse().expect("region base URLs are valid")
    }
}

impl From<SigmaBaseUrl> for Url {
    fn from(value: SigmaBaseUrl) -> Self {
        value.url()
    }
}

/// How to react when lineage data cannot be fetched for a workbook element.
///
/// Threaded explicitly through the crawl; lineage fetches are the only
/// tolerated partial failure, and only under [`LineagePolicy::Tolerant`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineagePolicy {
    /// Propagate the failure and abort the snapshot build.
    #[default]
    Strict,
    /// Log a warning and treat the element as having no dependencies.
    Tolerant,
}

/// Connection configuration for one Sigma organization.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct OrganizationConfig {
    /// Base URL for the organization's cloud region, see [`SigmaBaseUrl`].
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub base_url: Url,
    /// A client ID with access to the Sigma API.
    pub client_id: String,
    /// The client secret paired with `client_id`.
    pub client_secret: Redacted<String>,
    /// Whether lineage fetch failures abort the crawl or degrade to warnings.
    #[serde(default)]
    pub lineage_policy: LineagePolicy,
    /// Request timeout in seconds (default: 60).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Page size for paginated list endpoints (default: 1000).
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_timeout() -> u64 {
    60
}

fn default_page_size() -> u32 {
    1000
}

impl OrganizationConfig {
    pub fn new(
        base_url: impl Into<Url>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            client_id: client_id.into(),
            client_secret: Redacted::from(client_secret.into()),
            lineage_policy: LineagePolicy::default(),
            timeout_secs: default_timeout(),
            page_size: default_page_size(),
        }
    }

    pub fn with_lineage_policy(mut self, policy: LineagePolicy) -> Self {
        self.lineage_policy = policy;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }
}

/// Filters the set of Sigma objects a crawl materializes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, Deserialize)]
pub struct SigmaFilter {
    /// Folder paths to fetch workbooks from, each a list of folder names
    /// starting at the root. Empty means every workbook is fetched.
    #[serde(default)]
    pub workbook_folders: Vec<Vec<String>>,
    /// Whether to include datasets not used by any retained workbook.
    #[serde(default = "default_true")]
    pub include_unused_datasets: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SigmaFilter {
    fn default() -> Self {
        Self {
            workbook_folders: Vec::new(),
            include_unused_datasets: true,
        }
    }
}

impl SigmaFilter {
    /// Whether a workbook at `path` is retained by this filter.
    ///
    /// Matching lowercases both sides and compares the `/`-joined folder
    /// path as a plain string prefix, so a folder `["A", "B"]` also matches
    /// a workbook under `A/BC`.
    pub fn matches_workbook_path(&self, path: &str) -> bool {
        if self.workbook_folders.is_empty() {
            return true;
        }
        let path = path.to_lowercase();
        self.workbook_folders
            .iter()
            .any(|folder| path.starts_with(&folder.join("/").to_lowercase()))
    }
}

/// A wrapper that redacts its contents in `Debug` output.
///
/// Used for the API client secret. The inner value is reachable through
/// `Deref`, but `Debug` prints `<redacted>` and the type deliberately does
/// not implement `Serialize`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Redacted<T>(T);

impl<T> Redacted<T> {
    /// Consumes the wrapper and returns the inner value.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> From<T> for Redacted<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T> std::ops::Deref for Redacted<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> AsRef<T> for Redacted<T> {
    fn as_ref(&self) -> &T {
        &self.0
    }
}

impl<T> std::fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

impl<'de, T> Deserialize<'de> for Redacted<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        T::deserialize(deserializer).map(Redacted)
    }
}
