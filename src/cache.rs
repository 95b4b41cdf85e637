//! Single-flight memoization for remote fetches.
//!
//! Every distinct (endpoint, arguments) pair must be resolved by at most one
//! network call per organization value, even when the lineage and column
//! crawls race each other onto the same workbook pages. [`Memo`] keys a map
//! of shared futures by argument tuple: the first caller installs the fetch,
//! concurrent callers await the same future, and a resolved failure is
//! evicted so a later call can retry. Successes persist until the owning
//! [`FetchCache`] is dropped with its organization.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::collections::HashMap;
use std::hash::Hash;

use futures::future::{BoxFuture, Shared};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::model::{
    ColumnDocument, DatasetDocument, ElementDocument, ElementLineage, Inode, MemberDocument,
    OrganizationSnapshot, PageDocument, QueryDocument, TableDocument, WorkbookDocument,
};
use crate::SigmaFilter;

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V>>>;

/// A per-key single-flight cache.
///
/// The mutex guards only the key map; it is never held across an await of
/// the underlying fetch, so concurrent lookups of different keys proceed
/// independently.
pub(crate) struct Memo<K, V> {
    inflight: Mutex<HashMap<K, SharedFetch<V>>>,
}

impl<K, V> Default for Memo<K, V> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> Memo<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Returns the memoized result for `key`, running `fetch` if no call for
    /// this key is in flight or completed.
    pub(crate) async fn get_or_fetch<F>(&self, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> BoxFuture<'static, Result<V>>,
    {
        use futures::FutureExt as _;

        let fut = {
            let mut inflight = self.inflight.lock().await;
            match inflight.entry(key.clone()) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(entry) => entry.insert(fetch().shared()).clone(),
            }
        };

        let result = fut.clone().await;
        if result.is_err() {
            // Failures are not cached; evict so the next caller retries.
            // Guard against evicting a newer in-flight retry for the key.
            let mut inflight = self.inflight.lock().await;
            if let Entry::Occupied(entry) = inflight.entry(key) {
                if entry.get().ptr_eq(&fut) {
                    entry.remove();
                }
            }
        }
        result
    }
}

/// One [`Memo`] per remote endpoint family, plus the organization-wide
/// inference results, keyed the way the API is keyed.
#[derive(Default)]
pub(crate) struct FetchCache {
    pub workbooks: Memo<(), Vec<WorkbookDocument>>,
    pub datasets: Memo<(), Vec<DatasetDocument>>,
    pub tables: Memo<(), Vec<TableDocument>>,
    pub members: Memo<(), Vec<MemberDocument>>,
    /// Keyed by workbook id.
    pub pages: Memo<String, Vec<PageDocument>>,
    /// Keyed by (workbook id, page id).
    pub elements: Memo<(String, String), Vec<ElementDocument>>,
    /// Keyed by (workbook id, element id).
    pub lineage: Memo<(String, String), ElementLineage>,
    /// Keyed by (workbook id, element id).
    pub columns: Memo<(String, String), Vec<ColumnDocument>>,
    /// Keyed by workbook id.
    pub queries: Memo<String, Vec<QueryDocument>>,
    pub dataset_upstreams: Memo<(), BTreeMap<Inode, BTreeSet<String>>>,
    pub dataset_columns: Memo<(), BTreeMap<Inode, BTreeSet<String>>>,
    pub snapshots: Memo<(SigmaFilter, bool), OrganizationSnapshot>,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use futures::FutureExt as _;

    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let memo: Memo<&str, u32> = Memo::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = |calls: Arc<AtomicUsize>| {
            move || {
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<_, Error>(7)
                }
                .boxed()
            }
        };

        let (a, b) = tokio::join!(
            memo.get_or_fetch("key", fetch(calls.clone())),
            memo.get_or_fetch("key", fetch(calls.clone())),
        );
        assert_eq!(a.unwrap(), 7);
        assert_eq!(b.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn completed_results_are_reused() {
        let memo: Memo<&str, u32> = Memo::default();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            let value = memo
                .get_or_fetch("key", move || {
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(7)
                    }
                    .boxed()
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let memo: Memo<&str, u32> = Memo::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let failing = calls.clone();
        let err = memo
            .get_or_fetch("key", move || {
                async move {
                    failing.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Request("boom".into()))
                }
                .boxed()
            })
            .await;
        assert!(err.is_err());

        let succeeding = calls.clone();
        let value = memo
            .get_or_fetch("key", move || {
                async move {
                    succeeding.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                }
                .boxed()
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn distinct_keys_fetch_independently() {
        let memo: Memo<&str, u32> = Memo::default();
        let a = memo
            .get_or_fetch("a", || async { Ok(1) }.boxed())
            .await
            .unwrap();
        let b = memo
            .get_or_fetch("b", || async { Ok(2) }.boxed())
            .await
            .unwrap();
        assert_eq!((a, b), (1, 2));
    }
}
