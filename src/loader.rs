//! Defs-loader adapter: the synchronous, cache-keyed entry point an
//! orchestration layer calls to obtain asset specs for one organization.
//!
//! On a cache miss the loader either restores a previously serialized
//! snapshot (when one was supplied and contains this organization's key) or
//! blocks the calling thread on the concurrent crawl, driven by a dedicated
//! current-thread runtime.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::assets::{AssetSpec, SigmaEntity, SigmaTranslator};
use crate::client::SigmaOrganization;
use crate::error::{Error, Result};
use crate::model::OrganizationSnapshot;
use crate::SigmaFilter;

/// Prefix of the cache key under which one organization's snapshot is
/// persisted and restored.
pub const DEFS_KEY_PREFIX: &str = "sigma/";

/// A persisted collection of organization snapshots, keyed by defs key.
///
/// This is the serialization boundary to the orchestration layer: the layer
/// stores the JSON produced by [`DefsSnapshot::to_json`] and hands it back
/// verbatim on a later load, skipping the crawl entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefsSnapshot {
    #[serde(default)]
    pub reconstruction_data: BTreeMap<String, serde_json::Value>,
}

impl DefsSnapshot {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Parse(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Parse(e.to_string()))
    }

    /// Stores a snapshot under `key`.
    pub fn insert(&mut self, key: impl Into<String>, snapshot: &OrganizationSnapshot) -> Result<()> {
        let value = serde_json::to_value(snapshot).map_err(|e| Error::Parse(e.to_string()))?;
        self.reconstruction_data.insert(key.into(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.reconstruction_data.get(key)
    }
}

/// Loads asset specs for one Sigma organization.
pub struct SigmaDefsLoader<T> {
    organization: SigmaOrganization,
    translator: T,
    filter: SigmaFilter,
    fetch_column_data: bool,
    snapshot: Option<DefsSnapshot>,
}

impl<T: SigmaTranslator> SigmaDefsLoader<T> {
    pub fn new(organization: SigmaOrganization, translator: T) -> Self {
        Self {
            organization,
            translator,
            filter: SigmaFilter::default(),
            fetch_column_data: true,
            snapshot: None,
        }
    }

    pub fn with_filter(mut self, filter: SigmaFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_fetch_column_data(mut self, fetch_column_data: bool) -> Self {
        self.fetch_column_data = fetch_column_data;
        self
    }

    /// Supplies a persisted snapshot; when it contains this organization's
    /// defs key, the crawl is skipped and the stored state used verbatim.
    pub fn with_snapshot(mut self, snapshot: DefsSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// The stable cache key for this organization.
    pub fn defs_key(&self) -> String {
        format!("{DEFS_KEY_PREFIX}{}", self.organization.client_id())
    }

    /// Restores or crawls the organization state.
    ///
    /// Blocks the calling thread; the concurrent crawl runs on an internal
    /// current-thread runtime. Must not be called from within an async
    /// context.
    pub fn fetch_state(&self) -> Result<OrganizationSnapshot> {
        let key = self.defs_key();
        if let Some(snapshot) = &self.snapshot {
            if let Some(value) = snapshot.get(&key) {
                debug!(key = %key, "restoring organization data from snapshot");
                return serde_json::from_value(value.clone())
                    .map_err(|e| Error::Parse(e.to_string()));
            }
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Runtime(e.to_string()))?;
        runtime.block_on(
            self.organization
                .build_organization_data(&self.filter, self.fetch_column_data),
        )
    }

    /// Translates every workbook and dataset in the organization state into
    /// an asset spec.
    ///
    /// # Panics
    ///
    /// Panics if the translator returns a spec whose key differs from its
    /// own `asset_key` derivation for the same entity; that is a contract
    /// violation in the translator, not a data error.
    pub fn load_asset_specs(&self) -> Result<Vec<AssetSpec>> {
        let state = self.fetch_state()?;
        let specs = state
            .workbooks
            .iter()
            .map(|workbook| {
                checked_spec(&self.translator, &state, SigmaEntity::Workbook(workbook))
            })
            .chain(
                state
                    .datasets
                    .iter()
                    .map(|dataset| checked_spec(&self.translator, &state, SigmaEntity::Dataset(dataset))),
            )
            .collect();
        Ok(specs)
    }
}

/// Derives the key and spec for one entity, asserting they agree.
fn checked_spec<T: SigmaTranslator>(
    translator: &T,
    snapshot: &OrganizationSnapshot,
    entity: SigmaEntity<'_>,
) -> AssetSpec {
    let key = translator.asset_key(snapshot, entity);
    let spec = translator.asset_spec(snapshot, entity);
    assert!(
        spec.key == key,
        "asset key mismatch: translator returned a spec keyed `{}` for an entity keyed `{}`",
        spec.key,
        key
    );
    spec
}
