use crate::error::SinkError;
use crate::query::SearchRequest;
use crate::record::LogRecord;
use crate::sink::{LogSink, SearchHits};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// In-process search backend.
///
/// Keeps every document in memory, grouped by index, and evaluates
/// queries with [`Query::matches`](crate::query::Query::matches). Useful
/// for tests, demos and measuring the overhead of the middleware without
/// any network I/O. [`MemoryStore::set_available`] simulates an outage.
#[derive(Debug)]
pub struct MemoryStore {
    indices: RwLock<BTreeMap<String, Vec<LogRecord>>>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore {
            indices: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle whether the store answers requests.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Names of the indices that currently hold documents.
    pub async fn indices(&self) -> Vec<String> {
        self.indices.read().await.keys().cloned().collect()
    }

    /// Total number of stored documents across all indices.
    pub async fn len(&self) -> usize {
        self.indices.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> Result<(), SinkError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SinkError::Unavailable)
        }
    }
}

fn index_matches(pattern: &str, index: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => index.starts_with(prefix),
        None => index == pattern,
    }
}

#[async_trait]
impl LogSink for MemoryStore {
    async fn send(&self, index: &str, record: &LogRecord) -> Result<(), SinkError> {
        self.check_available()?;
        self.indices
            .write()
            .await
            .entry(index.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn search(&self, index_pattern: &str, request: &SearchRequest) -> Result<SearchHits, SinkError> {
        self.check_available()?;
        let indices = self.indices.read().await;

        let mut matched: Vec<&LogRecord> = indices
            .iter()
            .filter(|(name, _)| index_matches(index_pattern, name))
            .flat_map(|(_, docs)| docs.iter())
            .filter(|record| request.query.matches(record))
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let total = matched.len() as u64;
        let records = matched
            .into_iter()
            .skip(request.from)
            .take(request.size)
            .cloned()
            .collect();

        Ok(SearchHits { records, total })
    }

    async fn ping(&self) -> Result<bool, SinkError> {
        Ok(self.available.load(Ordering::SeqCst))
    }
}
