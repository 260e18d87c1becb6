use crate::error::SinkError;
use crate::query::{build_search, by_request_id, AuditLogFilter};
use crate::record::LogRecord;
use crate::sink::{LogSink, SearchHits};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Index name of the daily partition holding records stamped `timestamp`.
pub fn partition_name(base: &str, timestamp: DateTime<Utc>) -> String {
    format!("{}-{}", base, timestamp.format("%Y.%m.%d"))
}

/// Read-side pattern spanning every daily partition.
pub fn search_pattern(base: &str) -> String {
    format!("{}-*", base)
}

/// Writes audit records into date-partitioned indices and reads them back.
///
/// All public operations are best effort: backend failures are logged
/// here and turned into "nothing happened" results, so callers never
/// have to handle an error from the audit tier.
#[derive(Clone)]
pub struct IndexWriter {
    sink: Arc<dyn LogSink>,
    base_index: String,
}

impl IndexWriter {
    pub fn new(sink: Arc<dyn LogSink>, base_index: impl Into<String>) -> Self {
        IndexWriter {
            sink,
            base_index: base_index.into(),
        }
    }

    pub fn base_index(&self) -> &str {
        &self.base_index
    }

    /// Store `record` once in its daily partition, propagating failures.
    pub async fn try_write(&self, record: &LogRecord) -> Result<(), SinkError> {
        let index = partition_name(&self.base_index, record.timestamp);
        self.sink.send(&index, record).await?;
        debug!(request_id = %record.request_id, index = %index, "audit record stored");
        Ok(())
    }

    /// Store `record` once; a failed write is logged and dropped.
    pub async fn write(&self, record: &LogRecord) {
        if let Err(e) = self.try_write(record).await {
            warn!(request_id = %record.request_id, error = %e, "failed to store audit record");
        }
    }

    /// Look up the record of a single call across every partition.
    pub async fn find_by_request_id(&self, request_id: &str) -> Option<LogRecord> {
        let pattern = search_pattern(&self.base_index);
        match self.sink.search(&pattern, &by_request_id(request_id)).await {
            Ok(hits) => hits.records.into_iter().next(),
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "audit lookup failed");
                None
            }
        }
    }

    /// Paginated search, most recent first. Any failure yields an empty
    /// page with a zero total.
    pub async fn search(&self, filter: &AuditLogFilter) -> SearchHits {
        let request = build_search(filter);
        let pattern = search_pattern(&self.base_index);
        match self.sink.search(&pattern, &request).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "audit search failed");
                SearchHits::default()
            }
        }
    }

    /// Whether the backend is reachable. Never fails.
    pub async fn ping(&self) -> bool {
        match self.sink.ping().await {
            Ok(alive) => alive,
            Err(e) => {
                debug!(error = %e, "audit backend ping failed");
                false
            }
        }
    }
}
