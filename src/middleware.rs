//! Audit middleware observing every HTTP call.
//!
//! [`AuditLayer`] wraps the whole application. For each call it:
//! - generates a request id and attaches it as [`RequestId`] and as the
//!   `request_id` field of the call's tracing span
//! - buffers the request body when it is eligible for capture and hands
//!   an identical body downstream
//! - buffers error responses that are eligible for capture and returns
//!   the exact same bytes to the client
//! - finalizes one [`LogRecord`] on every exit path (response, service
//!   error, panic, cancellation) and queues it on the [`AsyncDispatcher`]
//!   without waiting for the write
//!
//! Service errors and panics from the inner service are recorded and then
//! passed on unchanged.

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request},
    http::{header, HeaderMap, StatusCode},
    response::Response,
};
use futures::{future, stream, FutureExt, StreamExt};
use http_body_util::BodyExt;
use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    collections::BTreeMap,
    future::Future,
    net::SocketAddr,
    panic::AssertUnwindSafe,
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};
use tower::{Layer, Service};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::capture::{body_text, CapturePolicy};
use crate::dispatcher::AsyncDispatcher;
use crate::record::LogRecord;

/// Status recorded for calls abandoned before the inner service finished.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Identifier of the current call, inserted into request extensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Authenticated caller, as published by the authentication layer.
///
/// Read from request extensions when authentication runs outside this
/// middleware, or from response extensions when it runs inside.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub email: Option<String>,
}

/// Layer installing [`AuditMiddleware`] in front of a service.
#[derive(Clone)]
pub struct AuditLayer {
    dispatcher: AsyncDispatcher,
    policy: CapturePolicy,
}

impl AuditLayer {
    pub fn new(dispatcher: AsyncDispatcher) -> Self {
        Self::with_policy(dispatcher, CapturePolicy::default())
    }

    pub fn with_policy(dispatcher: AsyncDispatcher, policy: CapturePolicy) -> Self {
        Self { dispatcher, policy }
    }
}

impl<S> Layer<S> for AuditLayer {
    type Service = AuditMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuditMiddleware {
            inner,
            dispatcher: self.dispatcher.clone(),
            policy: self.policy.clone(),
        }
    }
}

/// Audit middleware service
#[derive(Clone)]
pub struct AuditMiddleware<S> {
    inner: S,
    dispatcher: AsyncDispatcher,
    policy: CapturePolicy,
}

impl<S> Service<Request> for AuditMiddleware<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::fmt::Display + std::fmt::Debug + Send,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request) -> Self::Future {
        // The service polled ready is the one that must handle the call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let dispatcher = self.dispatcher.clone();
        let policy = self.policy.clone();

        Box::pin(async move {
            let started = Instant::now();
            let request_id = Uuid::new_v4().to_string();
            let mut pending = PendingRecord {
                record: Some(start_record(&request, &request_id)),
                started,
                dispatcher,
            };
            request.extensions_mut().insert(RequestId(request_id.clone()));

            let request = if policy.capture_request(request.headers()) {
                let (request, text) = buffer_request(request, &policy).await;
                if let Some(record) = pending.record.as_mut() {
                    record.request_body = text;
                }
                request
            } else {
                request
            };

            let span = info_span!("http_audit", request_id = %request_id);
            let outcome = AssertUnwindSafe(async move { inner.call(request).await })
                .catch_unwind()
                .instrument(span)
                .await;

            match outcome {
                Ok(Ok(response)) => {
                    let (response, body) = capture_response(response, &policy).await;
                    let principal = response.extensions().get::<Principal>().cloned();
                    let status = response.status();
                    pending.complete(|record| {
                        record.status_code = status.as_u16();
                        record.response_body = body;
                        if record.user_id.is_none() {
                            apply_principal(record, principal.as_ref());
                        }
                    });
                    Ok(response)
                }
                Ok(Err(err)) => {
                    pending.complete(|record| {
                        record.status_code = StatusCode::INTERNAL_SERVER_ERROR.as_u16();
                        record.error_message = Some(err.to_string());
                        record.stack_trace = Some(format!("{:?}", err));
                    });
                    Err(err)
                }
                Err(panic) => {
                    pending.complete(|record| {
                        record.status_code = StatusCode::INTERNAL_SERVER_ERROR.as_u16();
                        record.error_message = Some(panic_message(&*panic));
                        record.stack_trace = captured_backtrace();
                    });
                    std::panic::resume_unwind(panic)
                }
            }
        })
    }
}

/// Record under construction for one call.
///
/// Dropping it before [`PendingRecord::complete`] (the call future was
/// cancelled) still finalizes and dispatches the record.
struct PendingRecord {
    record: Option<LogRecord>,
    started: Instant,
    dispatcher: AsyncDispatcher,
}

impl PendingRecord {
    fn complete(mut self, fill: impl FnOnce(&mut LogRecord)) {
        if let Some(mut record) = self.record.take() {
            fill(&mut record);
            self.finish(record);
        }
    }

    fn finish(&self, mut record: LogRecord) {
        record.finalize(self.started);
        debug!(
            request_id = %record.request_id,
            method = %record.method,
            path = %record.path,
            status = record.status_code,
            duration_ms = record.duration_ms,
            "dispatching audit record"
        );
        self.dispatcher.dispatch(record);
    }
}

impl Drop for PendingRecord {
    fn drop(&mut self) {
        if let Some(mut record) = self.record.take() {
            record.status_code = CLIENT_CLOSED_REQUEST;
            record.error_message = Some("request cancelled before completion".to_string());
            self.finish(record);
        }
    }
}

fn start_record(request: &Request, request_id: &str) -> LogRecord {
    let mut record = LogRecord::new(request_id, request.method().as_str(), request.uri().path());
    record.query_string = request.uri().query().map(str::to_string);
    record.ip_address = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string());
    record.user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    record.request_headers = recorded_headers(request.headers());
    apply_principal(&mut record, request.extensions().get::<Principal>());
    record
}

fn apply_principal(record: &mut LogRecord, principal: Option<&Principal>) {
    if let Some(principal) = principal {
        record.user_id = Some(principal.id.clone());
        record.user_email = principal.email.clone();
    }
}

/// Header name to value, joining repeated headers. The authorization
/// header is never recorded.
fn recorded_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .keys()
        .filter(|name| *name != header::AUTHORIZATION)
        .filter_map(|name| {
            let values: Vec<&str> = headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            if values.is_empty() {
                None
            } else {
                Some((name.as_str().to_string(), values.join(", ")))
            }
        })
        .collect()
}

/// Read the request body for capture and rebuild the request so
/// downstream sees the same bytes.
///
/// Reading stops as soon as the body outgrows the capture limit; what was
/// read is replayed and the rest streams through unbuffered. A read error
/// is replayed after the bytes received before it.
async fn buffer_request(request: Request, policy: &CapturePolicy) -> (Request, Option<String>) {
    let (parts, mut body) = request.into_parts();
    let mut buffered = Vec::new();

    loop {
        match body.frame().await {
            None => {
                let bytes = Bytes::from(buffered);
                let text = policy.request_text(&bytes);
                return (Request::from_parts(parts, Body::from(bytes)), text);
            }
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    buffered.extend_from_slice(data);
                }
                if buffered.len() > policy.max_request_body {
                    let head = stream::once(future::ready(Ok(Bytes::from(buffered))));
                    let replay = head.chain(body.into_data_stream());
                    return (Request::from_parts(parts, Body::from_stream(replay)), None);
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "failed to buffer request body");
                let replay = stream::iter([Ok(Bytes::from(buffered)), Err(e)]);
                return (Request::from_parts(parts, Body::from_stream(replay)), None);
            }
        }
    }
}

/// Buffer an error response that qualifies for capture; the client gets
/// the buffered bytes verbatim. Other responses pass through unbuffered.
async fn capture_response(response: Response, policy: &CapturePolicy) -> (Response, Option<String>) {
    if !policy.capture_response(response.status(), response.headers()) {
        return (response, None);
    }

    let (parts, body) = response.into_parts();
    match body.collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            let text = body_text(&bytes);
            (Response::from_parts(parts, Body::from(bytes)), text)
        }
        Err(e) => {
            warn!(error = %e, "failed to capture response body");
            // Surface the same failure to the client instead of a truncated body.
            let failed = stream::once(future::ready(Err::<Bytes, axum::Error>(e)));
            (Response::from_parts(parts, Body::from_stream(failed)), None)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn captured_backtrace() -> Option<String> {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}
