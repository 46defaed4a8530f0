use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tokio::sync::Mutex;

use super::{Filter, Page, PageRequest, RecordStore, StoreError};

#[derive(Default)]
struct KindTable {
    next_seq: u64,
    // id -> insertion sequence
    index: HashMap<String, u64>,
    // insertion sequence -> (id, body)
    rows: BTreeMap<u64, (String, Value)>,
}

/// In-memory record store. Contents live as long as the store.
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<HashMap<String, KindTable>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records of a kind (test utility).
    pub async fn count(&self, kind: &str) -> usize {
        self.inner.lock().await.get(kind).map(|t| t.rows.len()).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryRecordStore {
    async fn store(&self, kind: &str, id: &str, body: Value) -> Result<(), StoreError> {
        if !body.is_object() {
            return Err(StoreError::permanent("store", format!("{kind}/{id}: body is not an object")));
        }
        let mut g = self.inner.lock().await;
        let table = g.entry(kind.to_string()).or_default();
        match table.index.get(id) {
            Some(seq) => {
                table.rows.insert(*seq, (id.to_string(), body));
            }
            None => {
                let seq = table.next_seq;
                table.next_seq += 1;
                table.index.insert(id.to_string(), seq);
                table.rows.insert(seq, (id.to_string(), body));
            }
        }
        Ok(())
    }

    async fn load(&self, kind: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let g = self.inner.lock().await;
        Ok(g.get(kind)
            .and_then(|t| t.index.get(id).and_then(|seq| t.rows.get(seq)))
            .map(|(_, body)| body.clone()))
    }

    async fn query(&self, kind: &str, filter: &Filter, page: PageRequest) -> Result<Page<Value>, StoreError> {
        let g = self.inner.lock().await;
        let Some(table) = g.get(kind) else {
            return Ok(Page { items: Vec::new(), next: None });
        };
        let matching: Vec<&Value> = table.rows.values().map(|(_, b)| b).filter(|b| filter.matches(b)).collect();
        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect();
        Ok(Page::from_window(items, page, total))
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<bool, StoreError> {
        let mut g = self.inner.lock().await;
        let Some(table) = g.get_mut(kind) else {
            return Ok(false);
        };
        match table.index.remove(id) {
            Some(seq) => {
                table.rows.remove(&seq);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
