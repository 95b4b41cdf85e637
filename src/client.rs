//! Authenticated Sigma API client.
//!
//! Wraps a [`reqwest::Client`] with the organization's client-credential
//! grant, exhaustive pagination over the `entries` list endpoints, and a
//! memoized fetcher per endpoint family. The bearer token is fetched lazily
//! on first use and reused for the lifetime of the organization value; there
//! is no refresh on expiry.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt as _;
use reqwest::{header, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::cache::FetchCache;
use crate::error::{Error, Result};
use crate::model::{
    ColumnDocument, DatasetDocument, ElementDocument, ElementLineage, MemberDocument, Paginated,
    PageDocument, QueryDocument, TableDocument, WorkbookDocument,
};
use crate::OrganizationConfig;

/// Partner identification header sent with every request.
const PARTNER_ID_HEADER: (&str, &str) = ("X-Sigma-Partner-Id", "sigma-datasets");

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// A Sigma organization and the client state for crawling it.
///
/// Cloning is cheap and shares the fetch cache and token, so concurrent
/// crawl tasks over clones still make at most one network call per distinct
/// request.
#[derive(Clone)]
pub struct SigmaOrganization {
    inner: Arc<OrganizationInner>,
}

struct OrganizationInner {
    config: OrganizationConfig,
    http: reqwest::Client,
    /// Base URL without a trailing slash.
    base_url: String,
    token: OnceCell<String>,
    cache: FetchCache,
}

impl SigmaOrganization {
    pub fn new(config: OrganizationConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Request(e.to_string()))?;
        let base_url = config.base_url.as_str().trim_end_matches('/').to_string();
        Ok(Self {
            inner: Arc::new(OrganizationInner {
                config,
                http,
                base_url,
                token: OnceCell::new(),
                cache: FetchCache::default(),
            }),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub(crate) fn config(&self) -> &OrganizationConfig {
        &self.inner.config
    }

    pub(crate) fn cache(&self) -> &FetchCache {
        &self.inner.cache
    }

    /// Exchanges the client credentials for a bearer token.
    async fn fetch_api_token(&self) -> Result<String> {
        debug!("requesting api token");
        let url = format!("{}/v2/auth/token", self.inner.base_url);
        let response = self
            .inner
            .http
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .header(PARTNER_ID_HEADER.0, PARTNER_ID_HEADER.1)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.inner.config.client_id.as_str()),
                ("client_secret", self.inner.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth { status, body });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;
        Ok(token.access_token)
    }

    async fn api_token(&self) -> Result<&str> {
        self.inner
            .token
            .get_or_try_init(|| self.fetch_api_token())
            .await
            .map(String::as_str)
    }

    /// Issues an authenticated request against `/v2/{endpoint}` and decodes
    /// the JSON response.
    pub(crate) async fn request<T>(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let token = self.api_token().await?;
        let url = format!("{}/v2/{}", self.inner.base_url, endpoint);
        let response = self
            .inner
            .http
            .request(method, &url)
            .header(header::ACCEPT, "application/json")
            .header(PARTNER_ID_HEADER.0, PARTNER_ID_HEADER.1)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(|e| Error::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Http { status, body });
        }

        response.json().await.map_err(|e| Error::Parse(e.to_string()))
    }

    /// Walks every page of a paginated list endpoint, concatenating entries
    /// in received order. Each page's cursor comes from the previous
    /// response, so the walk is strictly sequential and never re-requests a
    /// page.
    pub(crate) async fn paginate<T>(&self, endpoint: &str, query: &[(&str, String)]) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let limit = self.inner.config.page_size;
        let mut entries = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut page_query: Vec<(&str, String)> = query.to_vec();
            page_query.push(("limit", limit.to_string()));
            if let Some(page) = &cursor {
                page_query.push(("page", page.clone()));
            }

            let page: Paginated<T> = self.request(Method::GET, endpoint, &page_query).await?;
            let received = page.entries.len();
            entries.extend(page.entries);
            debug!(
                endpoint,
                received,
                total = entries.len(),
                has_more = page.has_more,
                "fetched page"
            );

            if !page.has_more {
                return Ok(entries);
            }
            cursor = Some(page.next_page.ok_or_else(|| {
                Error::Parse(format!(
                    "`{endpoint}` signalled more pages without a nextPage cursor"
                ))
            })?);
        }
    }

    /// All workbooks in the organization.
    pub async fn fetch_workbooks(&self) -> Result<Vec<WorkbookDocument>> {
        let this = self.clone();
        self.inner
            .cache
            .workbooks
            .get_or_fetch((), move || {
                async move { this.paginate("workbooks", &[]).await }.boxed()
            })
            .await
    }

    /// All datasets in the organization.
    pub async fn fetch_datasets(&self) -> Result<Vec<DatasetDocument>> {
        let this = self.clone();
        self.inner
            .cache
            .datasets
            .get_or_fetch((), move || {
                async move { this.paginate("datasets", &[]).await }.boxed()
            })
            .await
    }

    /// All warehouse tables known to the organization.
    pub async fn fetch_tables(&self) -> Result<Vec<TableDocument>> {
        let this = self.clone();
        self.inner
            .cache
            .tables
            .get_or_fetch((), move || {
                async move {
                    this.paginate("files", &[("typeFilters", "table".to_string())])
                        .await
                }
                .boxed()
            })
            .await
    }

    /// All members of the organization.
    pub async fn fetch_members(&self) -> Result<Vec<MemberDocument>> {
        let this = self.clone();
        self.inner
            .cache
            .members
            .get_or_fetch((), move || {
                async move {
                    let page: Paginated<MemberDocument> = this
                        .request(Method::GET, "members", &[("limit", "500".to_string())])
                        .await?;
                    Ok(page.entries)
                }
                .boxed()
            })
            .await
    }

    /// The pages of one workbook.
    pub async fn fetch_pages(&self, workbook_id: &str) -> Result<Vec<PageDocument>> {
        let this = self.clone();
        let workbook_id = workbook_id.to_string();
        self.inner
            .cache
            .pages
            .get_or_fetch(workbook_id.clone(), move || {
                async move {
                    this.paginate(&format!("workbooks/{workbook_id}/pages"), &[])
                        .await
                }
                .boxed()
            })
            .await
    }

    /// The elements of one workbook page.
    pub async fn fetch_elements(
        &self,
        workbook_id: &str,
        page_id: &str,
    ) -> Result<Vec<ElementDocument>> {
        let this = self.clone();
        let workbook_id = workbook_id.to_string();
        let page_id = page_id.to_string();
        self.inner
            .cache
            .elements
            .get_or_fetch((workbook_id.clone(), page_id.clone()), move || {
                async move {
                    this.paginate(
                        &format!("workbooks/{workbook_id}/pages/{page_id}/elements"),
                        &[],
                    )
                    .await
                }
                .boxed()
            })
            .await
    }

    /// The lineage of one workbook element.
    pub async fn fetch_lineage(
        &self,
        workbook_id: &str,
        element_id: &str,
    ) -> Result<ElementLineage> {
        let this = self.clone();
        let workbook_id = workbook_id.to_string();
        let element_id = element_id.to_string();
        self.inner
            .cache
            .lineage
            .get_or_fetch((workbook_id.clone(), element_id.clone()), move || {
                async move {
                    this.request(
                        Method::GET,
                        &format!("workbooks/{workbook_id}/lineage/elements/{element_id}"),
                        &[],
                    )
                    .await
                }
                .boxed()
            })
            .await
    }

    /// The columns referenced by one workbook element.
    pub async fn fetch_element_columns(
        &self,
        workbook_id: &str,
        element_id: &str,
    ) -> Result<Vec<ColumnDocument>> {
        let this = self.clone();
        let workbook_id = workbook_id.to_string();
        let element_id = element_id.to_string();
        self.inner
            .cache
            .columns
            .get_or_fetch((workbook_id.clone(), element_id.clone()), move || {
                async move {
                    let page: Paginated<ColumnDocument> = this
                        .request(
                            Method::GET,
                            &format!("workbooks/{workbook_id}/elements/{element_id}/columns"),
                            &[],
                        )
                        .await?;
                    Ok(page.entries)
                }
                .boxed()
            })
            .await
    }

    /// All queries of one workbook, across every element.
    pub async fn fetch_workbook_queries(&self, workbook_id: &str) -> Result<Vec<QueryDocument>> {
        let this = self.clone();
        let workbook_id = workbook_id.to_string();
        self.inner
            .cache
            .queries
            .get_or_fetch(workbook_id.clone(), move || {
                async move {
                    let page: Paginated<QueryDocument> = this
                        .request(
                            Method::GET,
                            &format!("workbooks/{workbook_id}/queries"),
                            &[],
                        )
                        .await?;
                    Ok(page.entries)
                }
                .boxed()
            })
            .await
    }
}
