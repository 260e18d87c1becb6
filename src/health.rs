use crate::index::IndexWriter;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Health of a dependency as reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    /// Reachability problems in a non-critical tier.
    Degraded,
    /// Reserved for the primary relational store; never produced for the
    /// audit backend, whose outage must not gate readiness.
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub description: String,
}

/// Classifies reachability of the audit search backend.
#[derive(Clone)]
pub struct HealthProbe {
    writer: IndexWriter,
    timeout: Duration,
    /// Last status seen by the periodic probe; `None` before its first run.
    last: Arc<watch::Sender<Option<HealthStatus>>>,
}

impl HealthProbe {
    pub fn new(writer: IndexWriter, timeout: Duration) -> Self {
        let (last, _) = watch::channel(None);
        HealthProbe { writer, timeout, last: Arc::new(last) }
    }

    /// Follow the status transitions observed by [`HealthProbe::spawn_periodic`].
    pub fn subscribe(&self) -> watch::Receiver<Option<HealthStatus>> {
        self.last.subscribe()
    }

    /// Ping the backend once. Failure, timeout or an unexpected answer
    /// all map to [`HealthStatus::Degraded`].
    pub async fn check(&self) -> HealthReport {
        match tokio::time::timeout(self.timeout, self.writer.ping()).await {
            Ok(true) => HealthReport {
                status: HealthStatus::Healthy,
                description: "audit search backend is reachable".to_string(),
            },
            Ok(false) => HealthReport {
                status: HealthStatus::Degraded,
                description: "audit search backend did not answer the ping".to_string(),
            },
            Err(_) => HealthReport {
                status: HealthStatus::Degraded,
                description: format!("audit search backend ping timed out after {:?}", self.timeout),
            },
        }
    }

    /// Run [`HealthProbe::check`] every `interval`, logging and publishing
    /// status changes.
    pub fn spawn_periodic(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;
                let report = self.check().await;
                let changed = self.last.send_if_modified(|last| {
                    let changed = *last != Some(report.status);
                    *last = Some(report.status);
                    changed
                });
                if !changed {
                    continue;
                }
                match report.status {
                    HealthStatus::Healthy => info!(status = ?report.status, "{}", report.description),
                    _ => warn!(status = ?report.status, "{}", report.description),
                }
            }
        })
    }
}
