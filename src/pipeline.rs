use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{self, AuditApiState};
use crate::backend::{make_sink_from_config, parse_dsn, BackendBuildError, DsnError};
use crate::config::AuditConfig;
use crate::dispatcher::{AsyncDispatcher, DispatchStats};
use crate::health::HealthProbe;
use crate::index::IndexWriter;
use crate::middleware::AuditLayer;
use crate::sink::LogSink;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("invalid audit backend DSN: {0}")]
    Dsn(#[from] DsnError),

    #[error(transparent)]
    Backend(#[from] BackendBuildError),
}

/// The audit pipeline of one process: backend client, index writer,
/// background dispatcher and health probe.
///
/// Build it once at startup and hand [`AuditPipeline::layer`] to the
/// router. The backend client inside is shared by every request.
pub struct AuditPipeline {
    writer: IndexWriter,
    dispatcher: AsyncDispatcher,
    probe: HealthProbe,
    config: AuditConfig,
    dispatcher_handle: JoinHandle<()>,
}

impl AuditPipeline {
    /// Connect to the backend named by `config.dsn` and spawn the
    /// dispatcher. Must be called from within a Tokio runtime.
    pub fn start(config: AuditConfig) -> Result<Self, PipelineError> {
        let backend = parse_dsn(&config.dsn)?;
        let sink = make_sink_from_config(&backend, config.backend_timeout)?;
        info!(backend = ?backend.kind, index = %backend.index, "audit pipeline starting");
        Ok(Self::with_sink(sink, backend.index, config))
    }

    /// Assemble the pipeline around an already constructed sink.
    pub fn with_sink(sink: Arc<dyn LogSink>, base_index: impl Into<String>, config: AuditConfig) -> Self {
        let writer = IndexWriter::new(sink, base_index);
        let (dispatcher, dispatcher_handle) =
            AsyncDispatcher::new(writer.clone(), config.dispatcher.clone());
        let probe = HealthProbe::new(writer.clone(), config.backend_timeout);

        AuditPipeline {
            writer,
            dispatcher,
            probe,
            config,
            dispatcher_handle,
        }
    }

    /// Middleware recording every call through this pipeline.
    pub fn layer(&self) -> AuditLayer {
        AuditLayer::with_policy(self.dispatcher.clone(), self.config.capture.clone())
    }

    /// Search, lookup and health routes.
    pub fn admin_router(&self) -> axum::Router {
        api::router(AuditApiState {
            writer: self.writer.clone(),
            probe: self.probe.clone(),
        })
    }

    pub fn writer(&self) -> &IndexWriter {
        &self.writer
    }

    pub fn probe(&self) -> &HealthProbe {
        &self.probe
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// Start the periodic health probe at the configured interval.
    pub fn spawn_health_monitor(&self) -> JoinHandle<()> {
        self.probe.clone().spawn_periodic(self.config.health_interval)
    }

    /// Stop accepting records and wait up to `shutdown_timeout` for queued
    /// writes. Layers still held by a router keep serving; their records
    /// are dropped from here on. Whatever is left after the timeout is
    /// abandoned.
    pub async fn shutdown(self) {
        let AuditPipeline { dispatcher, mut dispatcher_handle, config, .. } = self;
        dispatcher.close();
        drop(dispatcher);

        let grace = config.shutdown_timeout;
        if tokio::time::timeout(grace, &mut dispatcher_handle).await.is_err() {
            warn!(timeout = ?grace, "audit dispatcher did not drain in time, abandoning queued records");
            dispatcher_handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::query::AuditLogFilter;
    use axum::{body::Body, extract::Request, routing::get, Router};
    use std::time::Duration;
    use tower::ServiceExt;

    #[tokio::test]
    async fn start_rejects_unknown_backends() {
        let config = AuditConfig { dsn: "kafka://broker/topic".to_string(), ..Default::default() };
        assert!(matches!(AuditPipeline::start(config), Err(PipelineError::Dsn(_))));
    }

    #[tokio::test]
    async fn recorded_calls_are_searchable_after_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = AuditPipeline::with_sink(store.clone(), "crm-audit", AuditConfig::default());
        let app = Router::new()
            .route("/api/companies", get(|| async { "[]" }))
            .layer(pipeline.layer());

        app.oneshot(Request::builder().uri("/api/companies").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let writer = pipeline.writer().clone();
        pipeline.shutdown().await;

        let hits = writer.search(&AuditLogFilter::default()).await;
        assert_eq!(hits.total, 1);
        assert_eq!(hits.records[0].path, "/api/companies");
        assert!(store.indices().await[0].starts_with("crm-audit-"));
    }

    #[tokio::test]
    async fn shutdown_returns_while_the_router_is_still_alive() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = AuditPipeline::with_sink(store.clone(), "crm-audit", AuditConfig::default());
        let app = Router::new()
            .route("/api/companies", get(|| async { "[]" }))
            .layer(pipeline.layer());

        app.clone()
            .oneshot(Request::builder().uri("/api/companies").body(Body::empty()).unwrap())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), pipeline.shutdown())
            .await
            .unwrap();
        assert_eq!(store.len().await, 1);

        // The router keeps serving; its records are no longer written.
        let response = app
            .oneshot(Request::builder().uri("/api/companies").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_success());
        tokio::task::yield_now().await;
        assert_eq!(store.len().await, 1);
    }
}
