use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};

use axum::{body::Body, extract::Request, routing::post, Router};
use tower::ServiceExt;

use http_audit_log::config::AuditConfig;
use http_audit_log::memory::MemoryStore;
use http_audit_log::AuditPipeline;

#[tokio::main]
async fn main() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = AuditPipeline::with_sink(store.clone(), "audit-logs", AuditConfig::default());

    let app = Router::new()
        .route("/api/companies", post(|body: String| async move { body.len().to_string() }))
        .layer(pipeline.layer());

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        let request = Request::builder()
            .method("POST")
            .uri("/api/companies")
            .header("content-type", "application/json")
            .body(Body::from(format!(r#"{{"name":"company-{}"}}"#, i)))
            .expect("valid request");
        let _ = app.clone().oneshot(request).await;
    }

    let elapsed = start.elapsed();
    println!("default config: served {} requests in {:?} (~{:.0} req/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    // Give background writers a little time to drain the channel
    sleep(Duration::from_secs(2)).await;
    let stats = pipeline.stats();
    println!(
        "enqueued={} dropped={} written={} stored={}",
        stats.enqueued,
        stats.dropped,
        stats.written,
        store.len().await
    );
}
