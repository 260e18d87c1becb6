use crate::index::IndexWriter;
use crate::record::LogRecord;
use std::sync::{Arc, atomic::{AtomicU64, Ordering}};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Sizing of the background delivery pool.
///
/// **Fields**
/// - `channel_buffer`: records that may wait for a writer before new
///   ones are dropped.
/// - `max_in_flight`: concurrent writes to the backend.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub channel_buffer: usize,
    pub max_in_flight: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            channel_buffer: 1024,
            max_in_flight: 16,
        }
    }
}

/// Point-in-time copy of the dispatcher counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub written: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
}

/// Hands finished [`LogRecord`]s to an [`IndexWriter`] off the request path.
///
/// Records go through a bounded channel to a background loop that runs at
/// most `max_in_flight` writes at once. When the channel is full the new
/// record is dropped and counted; [`AsyncDispatcher::dispatch`] never
/// waits. Delivery is at most once: failed writes are logged and
/// discarded, and records still queued at shutdown may be lost. Records
/// of different calls are written in no particular order.
#[derive(Clone)]
pub struct AsyncDispatcher {
    sender: mpsc::Sender<LogRecord>,
    counters: Arc<Counters>,
    closing: Arc<Notify>,
}

impl AsyncDispatcher {
    /// Create a dispatcher and spawn its delivery loop.
    ///
    /// The returned handle completes once every clone of the dispatcher
    /// has been dropped, or [`AsyncDispatcher::close`] was called, and the
    /// queued records have been written.
    pub fn new(writer: IndexWriter, config: DispatcherConfig) -> (Self, JoinHandle<()>) {
        // Enforce minimal thresholds to avoid degenerate configs.
        let buffer = config.channel_buffer.max(16);
        let max_in_flight = config.max_in_flight.max(1);

        let (tx, mut rx) = mpsc::channel::<LogRecord>(buffer);
        let counters = Arc::new(Counters::default());
        let counters_bg = Arc::clone(&counters);
        let closing = Arc::new(Notify::new());
        let closing_bg = Arc::clone(&closing);

        let handle = tokio::spawn(async move {
            let slots = Arc::new(Semaphore::new(max_in_flight));
            let mut closed = false;

            loop {
                let record = tokio::select! {
                    record = rx.recv() => record,
                    _ = closing_bg.notified(), if !closed => {
                        // Refuse new records; the ones already queued still drain.
                        rx.close();
                        closed = true;
                        continue;
                    }
                };
                let Some(record) = record else { break };
                let permit = match Arc::clone(&slots).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let writer = writer.clone();
                let counters = Arc::clone(&counters_bg);

                tokio::spawn(async move {
                    match writer.try_write(&record).await {
                        Ok(()) => {
                            counters.written.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                request_id = %record.request_id,
                                error = %e,
                                "dropping audit record after failed write"
                            );
                        }
                    }
                    drop(permit);
                });
            }

            // Wait for outstanding writes before reporting completion.
            let _ = slots.acquire_many(max_in_flight as u32).await;
            debug!("audit dispatcher drained");
        });

        (Self { sender: tx, counters, closing }, handle)
    }

    /// Stop accepting records, even while clones are still alive. Records
    /// already queued are still written; later ones are dropped.
    pub fn close(&self) {
        self.closing.notify_one();
    }

    /// Queue `record` for delivery and return immediately.
    pub fn dispatch(&self, record: LogRecord) {
        match self.sender.try_send(record) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(record)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(request_id = %record.request_id, "audit queue full, dropping record");
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(request_id = %record.request_id, "audit dispatcher stopped, dropping record");
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use crate::memory::MemoryStore;
    use crate::query::SearchRequest;
    use crate::sink::{LogSink, SearchHits};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// Sink whose writes block until released.
    struct GatedSink {
        gate: Notify,
        inner: MemoryStore,
    }

    #[async_trait]
    impl LogSink for GatedSink {
        async fn send(&self, index: &str, record: &LogRecord) -> Result<(), SinkError> {
            self.gate.notified().await;
            self.inner.send(index, record).await
        }

        async fn search(&self, index_pattern: &str, request: &SearchRequest) -> Result<SearchHits, SinkError> {
            self.inner.search(index_pattern, request).await
        }

        async fn ping(&self) -> Result<bool, SinkError> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn delivers_every_record_and_drains_on_close() {
        let store = Arc::new(MemoryStore::new());
        let writer = IndexWriter::new(store.clone(), "audit-logs");
        let (dispatcher, handle) = AsyncDispatcher::new(writer, DispatcherConfig::default());

        for i in 0..50 {
            dispatcher.dispatch(LogRecord::new(format!("req-{}", i), "GET", "/"));
        }
        assert_eq!(dispatcher.stats().enqueued, 50);

        let counters = Arc::clone(&dispatcher.counters);
        drop(dispatcher);
        handle.await.unwrap();

        assert_eq!(store.len().await, 50);
        assert_eq!(counters.written.load(Ordering::Relaxed), 50);
        assert_eq!(counters.dropped.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn failed_writes_are_counted_not_retried() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let writer = IndexWriter::new(store.clone(), "audit-logs");
        let (dispatcher, handle) = AsyncDispatcher::new(writer, DispatcherConfig::default());

        dispatcher.dispatch(LogRecord::new("req-1", "GET", "/"));
        let counters = Arc::clone(&dispatcher.counters);
        drop(dispatcher);
        handle.await.unwrap();

        assert_eq!(counters.failed.load(Ordering::Relaxed), 1);
        assert_eq!(counters.written.load(Ordering::Relaxed), 0);
        store.set_available(true);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn close_drains_while_clones_are_alive() {
        let store = Arc::new(MemoryStore::new());
        let writer = IndexWriter::new(store.clone(), "audit-logs");
        let (dispatcher, handle) = AsyncDispatcher::new(writer, DispatcherConfig::default());
        let held_by_router = dispatcher.clone();

        for i in 0..10 {
            dispatcher.dispatch(LogRecord::new(format!("req-{}", i), "GET", "/"));
        }
        dispatcher.close();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.len().await, 10);

        held_by_router.dispatch(LogRecord::new("late", "GET", "/"));
        let stats = held_by_router.stats();
        assert_eq!(stats.written, 10);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let sink = Arc::new(GatedSink { gate: Notify::new(), inner: MemoryStore::new() });
        let writer = IndexWriter::new(sink.clone(), "audit-logs");
        let config = DispatcherConfig { channel_buffer: 16, max_in_flight: 1 };
        let (dispatcher, _handle) = AsyncDispatcher::new(writer, config);

        // One write parks in the sink, one waits for a permit, sixteen
        // fill the channel; everything after that must be dropped.
        for i in 0..100 {
            dispatcher.dispatch(LogRecord::new(format!("req-{}", i), "GET", "/"));
            tokio::task::yield_now().await;
        }

        let stats = dispatcher.stats();
        assert_eq!(stats.enqueued + stats.dropped, 100);
        assert!(stats.dropped > 0);
        assert!(stats.enqueued <= 18);
        sink.gate.notify_waiters();
    }
}
