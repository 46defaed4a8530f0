use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

mod error;
/// In-memory record store for tests and single-process hosts.
pub mod memory;
/// SQLite-backed record store.
pub mod sqlite;

pub use error::StoreError;

/// Conjunction of equality clauses on top-level string fields of a record body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    clauses: Vec<(String, String)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    pub fn clauses(&self) -> &[(String, String)] {
        &self.clauses
    }

    /// Evaluate the filter against a JSON body. Non-string fields never match.
    pub fn matches(&self, body: &Value) -> bool {
        self.clauses
            .iter()
            .all(|(field, expected)| body.get(field).and_then(Value::as_str) == Some(expected.as_str()))
    }
}

/// Offset/limit page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            offset: 0,
            limit: limit.max(1),
        }
    }

    pub fn next(self) -> Self {
        Self {
            offset: self.offset + self.limit,
            limit: self.limit,
        }
    }
}

/// One page of query results; `next` is `None` once the result set is exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageRequest>,
}

impl<T> Page<T> {
    pub(crate) fn from_window(items: Vec<T>, request: PageRequest, total: usize) -> Self {
        let next = if request.offset + request.limit < total {
            Some(request.next())
        } else {
            None
        };
        Self { items, next }
    }
}

/// Storage abstraction for keyed records, grouped by kind.
///
/// Bodies are JSON objects. Query results are returned in insertion order;
/// re-storing an existing id keeps its original position.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace a record.
    async fn store(&self, kind: &str, id: &str, body: Value) -> Result<(), StoreError>;

    /// Load a record by id.
    async fn load(&self, kind: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// Query records of a kind matching `filter`, one page at a time.
    async fn query(&self, kind: &str, filter: &Filter, page: PageRequest) -> Result<Page<Value>, StoreError>;

    /// Delete a record. Returns whether it existed.
    async fn delete(&self, kind: &str, id: &str) -> Result<bool, StoreError>;

    /// Delete several records. Returns how many existed. Default calls `delete` for each id.
    async fn delete_batch(&self, kind: &str, ids: &[String]) -> Result<usize, StoreError> {
        let mut removed = 0;
        for id in ids {
            if self.delete(kind, id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// A typed record persisted through a [`RecordStore`].
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Record kind (table/collection name).
    const KIND: &'static str;

    fn record_id(&self) -> String;
}

/// Typed view of a [`RecordStore`] for one record kind.
pub struct Repository<T> {
    store: Arc<dyn RecordStore>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            _record: PhantomData,
        }
    }
}

impl<T: Record> Repository<T> {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            _record: PhantomData,
        }
    }

    pub fn backend(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub async fn store(&self, record: &T) -> Result<(), StoreError> {
        let body = serde_json::to_value(record).map_err(|e| StoreError::codec("store", e))?;
        self.store.store(T::KIND, &record.record_id(), body).await
    }

    pub async fn load(&self, id: &str) -> Result<Option<T>, StoreError> {
        match self.store.load(T::KIND, id).await? {
            Some(body) => serde_json::from_value(body)
                .map(Some)
                .map_err(|e| StoreError::codec("load", e)),
            None => Ok(None),
        }
    }

    pub async fn query(&self, filter: &Filter, page: PageRequest) -> Result<Page<T>, StoreError> {
        let raw = self.store.query(T::KIND, filter, page).await?;
        let items = raw
            .items
            .into_iter()
            .map(|body| serde_json::from_value(body).map_err(|e| StoreError::codec("query", e)))
            .collect::<Result<Vec<T>, _>>()?;
        Ok(Page { items, next: raw.next })
    }

    /// Query every page until the result set is exhausted.
    pub async fn query_all(&self, filter: &Filter, page_size: usize) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        let mut request = Some(PageRequest::first(page_size));
        while let Some(page) = request {
            let result = self.query(filter, page).await?;
            out.extend(result.items);
            request = result.next;
        }
        Ok(out)
    }

    /// Whether any record matches `filter`.
    pub async fn exists(&self, filter: &Filter) -> Result<bool, StoreError> {
        Ok(!self.query(filter, PageRequest::first(1)).await?.items.is_empty())
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.store.delete(T::KIND, id).await
    }

    pub async fn delete_batch(&self, ids: &[String]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.store.delete_batch(T::KIND, ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_matches_string_fields_only() {
        let body = json!({ "parent": "i-1", "count": 3 });
        assert!(Filter::new().eq("parent", "i-1").matches(&body));
        assert!(!Filter::new().eq("parent", "i-2").matches(&body));
        assert!(!Filter::new().eq("count", "3").matches(&body));
        assert!(Filter::new().matches(&body));
    }

    #[test]
    fn page_window_reports_next() {
        let req = PageRequest::first(2);
        let page = Page::from_window(vec![1, 2], req, 5);
        assert_eq!(page.next, Some(PageRequest { offset: 2, limit: 2 }));

        let last = Page::from_window(vec![5], PageRequest { offset: 4, limit: 2 }, 5);
        assert_eq!(last.next, None);
    }
}
