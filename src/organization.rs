//! Organization-wide crawl orchestration.
//!
//! Builds the [`OrganizationSnapshot`] out of many concurrent fetches: all
//! retained workbooks load jointly, each workbook fans out over its pages'
//! elements, and every element's lineage, columns and queries are awaited
//! together. The memoized fetch layer deduplicates the page and element
//! requests shared between the lineage and column passes.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use futures::future::try_join_all;
use futures::FutureExt as _;
use tracing::{debug, info, warn};

use crate::client::SigmaOrganization;
use crate::error::Result;
use crate::lineage::tables_from_sql;
use crate::model::{
    ElementDocument, ElementLineage, Inode, OrganizationSnapshot, SigmaDataset, SigmaTable,
    SigmaWorkbook, WorkbookDocument,
};
use crate::{LineagePolicy, SigmaFilter};

impl SigmaOrganization {
    /// Fetches lineage for one element, degrading to `None` under
    /// [`LineagePolicy::Tolerant`] when the fetch fails.
    async fn try_fetch_lineage(
        &self,
        workbook_id: &str,
        element_id: &str,
    ) -> Result<Option<ElementLineage>> {
        match self.fetch_lineage(workbook_id, element_id).await {
            Ok(lineage) => Ok(Some(lineage)),
            Err(err) if self.config().lineage_policy == LineagePolicy::Tolerant => {
                warn!(
                    workbook_id,
                    element_id,
                    error = %err,
                    "failed to fetch lineage for element"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// All elements of a workbook, fetched concurrently across its pages.
    async fn fetch_workbook_elements(&self, workbook_id: &str) -> Result<Vec<ElementDocument>> {
        let pages = self.fetch_pages(workbook_id).await?;
        let per_page = try_join_all(
            pages
                .iter()
                .map(|page| self.fetch_elements(workbook_id, &page.page_id)),
        )
        .await?;
        Ok(per_page.into_iter().flatten().collect())
    }

    /// Loads one workbook's full dependency data: every element's lineage,
    /// partitioned into dataset- and table-typed upstream node ids.
    pub async fn load_workbook_data(&self, raw: &WorkbookDocument) -> Result<SigmaWorkbook> {
        info!(workbook_id = %raw.workbook_id, "fetching data for workbook");

        let elements = self.fetch_workbook_elements(&raw.workbook_id).await?;
        let lineage: Vec<ElementLineage> = try_join_all(elements.iter().map(|element| {
            self.try_fetch_lineage(&raw.workbook_id, &element.element_id)
                .map(|res| res.map(Option::unwrap_or_default))
        }))
        .await?;

        let mut dataset_deps = BTreeSet::new();
        let mut direct_table_deps = BTreeSet::new();
        for element_lineage in &lineage {
            for node in element_lineage.dependencies.values() {
                if node.is_dataset() {
                    dataset_deps.insert(Inode::from(node.node_id.as_str()));
                }
                if node.is_table() {
                    direct_table_deps.insert(Inode::from(node.node_id.as_str()));
                }
            }
        }

        Ok(SigmaWorkbook {
            properties: raw.clone(),
            dataset_deps,
            direct_table_deps,
            lineage,
        })
    }

    /// Upstream `catalog.db.table` names contributed by one workbook, keyed
    /// by dataset inode.
    ///
    /// An element's queries are attributed only when its lineage reports
    /// exactly one dataset dependency; zero or several make the attribution
    /// ambiguous and the element is skipped.
    async fn workbook_upstream_contributions(
        &self,
        workbook: &WorkbookDocument,
    ) -> Result<BTreeMap<Inode, BTreeSet<String>>> {
        info!(
            workbook_id = %workbook.workbook_id,
            "inferring dataset dependencies for workbook"
        );

        let queries = self.fetch_workbook_queries(&workbook.workbook_id).await?;
        let mut queries_by_element: HashMap<&str, Vec<&str>> = HashMap::new();
        for query in &queries {
            queries_by_element
                .entry(query.element_id.as_str())
                .or_default()
                .push(query.sql.as_str());
        }

        let elements = self.fetch_workbook_elements(&workbook.workbook_id).await?;
        let lineages = try_join_all(
            elements
                .iter()
                .map(|element| self.try_fetch_lineage(&workbook.workbook_id, &element.element_id)),
        )
        .await?;

        let mut contributions: BTreeMap<Inode, BTreeSet<String>> = BTreeMap::new();
        for (element, lineage) in elements.iter().zip(lineages) {
            let Some(lineage) = lineage else {
                continue;
            };
            let dataset_nodes: Vec<_> = lineage
                .dependencies
                .values()
                .filter(|node| node.is_dataset())
                .collect();
            let [dataset] = dataset_nodes.as_slice() else {
                continue;
            };

            let inode = Inode::from(dataset.node_id.as_str());
            for sql in queries_by_element
                .get(element.element_id.as_str())
                .into_iter()
                .flatten()
            {
                let tables = tables_from_sql(sql)?;
                contributions.entry(inode.clone()).or_default().extend(tables);
            }
        }
        Ok(contributions)
    }

    /// Maps every dataset inode to the upstream tables it reads from,
    /// inferred from workbook lineage and query SQL across the whole
    /// organization. Best-effort: absence of an entry is non-observation,
    /// not proof of independence.
    pub async fn dataset_upstreams_by_inode(&self) -> Result<BTreeMap<Inode, BTreeSet<String>>> {
        let this = self.clone();
        self.cache()
            .dataset_upstreams
            .get_or_fetch((), move || {
                async move {
                    debug!("inferring dataset upstream dependencies");
                    let workbooks = this.fetch_workbooks().await?;
                    let partials = try_join_all(
                        workbooks
                            .iter()
                            .map(|workbook| this.workbook_upstream_contributions(workbook)),
                    )
                    .await?;

                    let mut merged: BTreeMap<Inode, BTreeSet<String>> = BTreeMap::new();
                    for partial in partials {
                        for (inode, tables) in partial {
                            merged.entry(inode).or_default().extend(tables);
                        }
                    }
                    Ok(merged)
                }
                .boxed()
            })
            .await
    }

    /// Column names observed for one workbook, keyed by dataset inode.
    async fn workbook_column_contributions(
        &self,
        workbook: &WorkbookDocument,
    ) -> Result<BTreeMap<Inode, BTreeSet<String>>> {
        info!(
            workbook_id = %workbook.workbook_id,
            "fetching column data from workbook"
        );

        let elements = self.fetch_workbook_elements(&workbook.workbook_id).await?;
        let per_element = try_join_all(
            elements
                .iter()
                .map(|element| self.fetch_element_columns(&workbook.workbook_id, &element.element_id)),
        )
        .await?;

        let mut contributions: BTreeMap<Inode, BTreeSet<String>> = BTreeMap::new();
        for column in per_element.into_iter().flatten() {
            // Column ids encode the owning dataset as `<inode>/<name>`;
            // anything that does not split into exactly two segments is not
            // attributable.
            let segments: Vec<&str> = column.column_id.split('/').collect();
            if let [inode, column_name] = segments.as_slice() {
                contributions
                    .entry(Inode::from(*inode))
                    .or_default()
                    .insert(column_name.to_string());
            }
        }
        Ok(contributions)
    }

    /// Maps dataset inodes to the columns observed for them across every
    /// workbook element in the organization. Necessarily partial: only
    /// columns referenced by at least one element are discoverable.
    pub async fn dataset_columns_by_inode(&self) -> Result<BTreeMap<Inode, BTreeSet<String>>> {
        let this = self.clone();
        self.cache()
            .dataset_columns
            .get_or_fetch((), move || {
                async move {
                    debug!("inferring dataset columns");
                    let workbooks = this.fetch_workbooks().await?;
                    let partials = try_join_all(
                        workbooks
                            .iter()
                            .map(|workbook| this.workbook_column_contributions(workbook)),
                    )
                    .await?;

                    let mut merged: BTreeMap<Inode, BTreeSet<String>> = BTreeMap::new();
                    for partial in partials {
                        for (inode, columns) in partial {
                            merged.entry(inode).or_default().extend(columns);
                        }
                    }
                    Ok(merged)
                }
                .boxed()
            })
            .await
    }

    /// Maps member ids to email addresses for the whole organization.
    pub async fn member_id_to_email(&self) -> Result<BTreeMap<String, String>> {
        let members = self.fetch_members().await?;
        Ok(members
            .into_iter()
            .map(|member| (member.member_id, member.email))
            .collect())
    }

    /// Crawls the organization and assembles its snapshot.
    ///
    /// Workbook inclusion follows the filter's folder paths; dataset and
    /// table inclusion is a pure function of the filter and the retained
    /// workbooks' dependency sets. Lineage and column inference always run
    /// over the whole organization so attribution does not depend on which
    /// folders were retained. Results are memoized per (filter, column
    /// flag) for the lifetime of this organization value.
    pub async fn build_organization_data(
        &self,
        filter: &SigmaFilter,
        fetch_column_data: bool,
    ) -> Result<OrganizationSnapshot> {
        let this = self.clone();
        let filter = filter.clone();
        self.cache()
            .snapshots
            .get_or_fetch((filter.clone(), fetch_column_data), move || {
                async move { this.build_snapshot(&filter, fetch_column_data).await }.boxed()
            })
            .await
    }

    async fn build_snapshot(
        &self,
        filter: &SigmaFilter,
        fetch_column_data: bool,
    ) -> Result<OrganizationSnapshot> {
        info!("beginning organization data fetch");

        let raw_workbooks = self.fetch_workbooks().await?;
        let retained: Vec<&WorkbookDocument> = raw_workbooks
            .iter()
            .filter(|workbook| filter.matches_workbook_path(&workbook.path))
            .collect();
        debug!(
            total = raw_workbooks.len(),
            retained = retained.len(),
            "applied workbook folder filter"
        );

        let workbooks = try_join_all(
            retained
                .iter()
                .map(|workbook| self.load_workbook_data(workbook)),
        )
        .await?;

        let (deps_by_inode, columns_by_inode) = tokio::try_join!(
            self.dataset_upstreams_by_inode(),
            async {
                if fetch_column_data {
                    self.dataset_columns_by_inode().await
                } else {
                    Ok(BTreeMap::new())
                }
            }
        )?;

        let mut used_datasets: BTreeSet<Inode> = BTreeSet::new();
        let mut used_tables: BTreeSet<Inode> = BTreeSet::new();
        for workbook in &workbooks {
            if !filter.include_unused_datasets {
                used_datasets.extend(workbook.dataset_deps.iter().cloned());
            }
            used_tables.extend(workbook.direct_table_deps.iter().cloned());
        }

        info!("fetching dataset data");
        let mut datasets = Vec::new();
        for document in self.fetch_datasets().await? {
            let inode = document.inode();
            if filter.include_unused_datasets || used_datasets.contains(&inode) {
                datasets.push(SigmaDataset {
                    columns: columns_by_inode.get(&inode).cloned().unwrap_or_default(),
                    inputs: deps_by_inode.get(&inode).cloned().unwrap_or_default(),
                    properties: document,
                });
            }
        }

        info!("fetching table data");
        let mut tables = Vec::new();
        for document in self.fetch_tables().await? {
            if used_tables.contains(&document.inode()) {
                tables.push(SigmaTable {
                    properties: document,
                });
            }
        }

        Ok(OrganizationSnapshot {
            workbooks,
            datasets,
            tables,
        })
    }
}
