use crate::error::SinkError;
use crate::query::SearchRequest;
use crate::record::LogRecord;
use async_trait::async_trait;

/// One page of search results plus the total number of matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHits {
    pub records: Vec<LogRecord>,
    pub total: u64,
}

/// Search backend that stores and queries [`LogRecord`]s.
///
/// Implementations own the transport to a concrete backend (OpenSearch,
/// in-process memory, ...). A single instance is shared by every request
/// and by the background writers, so it must tolerate concurrent use.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Insert `record` as a new document in `index`.
    ///
    /// Not idempotent: calling this twice stores two documents.
    async fn send(&self, index: &str, record: &LogRecord) -> Result<(), SinkError>;

    /// Run `request` against every index matching `index_pattern`.
    ///
    /// A trailing `*` in the pattern matches any suffix. Hits come back
    /// ordered by timestamp, most recent first.
    async fn search(&self, index_pattern: &str, request: &SearchRequest) -> Result<SearchHits, SinkError>;

    /// Lightweight liveness probe.
    ///
    /// Returns `Ok(true)` when the backend answered as expected.
    async fn ping(&self) -> Result<bool, SinkError>;
}
