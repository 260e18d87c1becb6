use crate::error::SinkError;
use crate::query::SearchRequest;
use crate::record::LogRecord;
use crate::sink::{LogSink, SearchHits};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use std::time::Duration;

/// Configuration for [`OpenSearchSink`].
#[derive(Clone, Debug)]
pub struct OpenSearchConfig {
    /// Base URL of the cluster, e.g. "http://localhost:9200".
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Per-request timeout applied to every call to the cluster.
    pub timeout: Duration,
    /// `index.max_result_window` of the audit indices. Pages ending past it
    /// are trimmed, and pages starting past it only fetch the total.
    pub max_result_window: usize,
}

pub const DEFAULT_MAX_RESULT_WINDOW: usize = 10_000;

impl OpenSearchConfig {
    pub fn new(url: impl Into<String>) -> Self {
        OpenSearchConfig {
            url: url.into(),
            username: None,
            password: None,
            timeout: Duration::from_secs(5),
            max_result_window: DEFAULT_MAX_RESULT_WINDOW,
        }
    }
}

/// OpenSearch (or Elasticsearch-compatible) backend over the REST API.
///
/// Writes go to `POST /{index}/_doc`, searches to
/// `POST /{pattern}/_search`. The underlying [`Client`] pools connections
/// and is shared by every clone of the sink.
#[derive(Clone)]
pub struct OpenSearchSink {
    client: Client,
    config: OpenSearchConfig,
}

impl OpenSearchSink {
    pub fn new(config: OpenSearchConfig) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(OpenSearchSink { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }

    /// Fit a page inside the result window so deep pages still report the
    /// real total instead of being rejected by the cluster.
    fn windowed(&self, request: &SearchRequest) -> SearchRequest {
        let window = self.config.max_result_window;
        if request.from >= window {
            SearchRequest::new(request.query.clone(), 0, 0)
        } else {
            let size = request.size.min(window - request.from);
            SearchRequest::new(request.query.clone(), request.from, size)
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.username {
            Some(user) => request.basic_auth(user, self.config.password.as_deref()),
            None => request,
        }
    }
}

async fn error_from(resp: Response) -> SinkError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_else(|_| "<no body>".to_string());
    SinkError::Status { status, body }
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: HitsEnvelope,
}

#[derive(Deserialize)]
struct HitsEnvelope {
    total: TotalHits,
    #[serde(default)]
    hits: Vec<Hit>,
}

/// `hits.total` is an object on current clusters and a bare number on
/// older ones.
#[derive(Deserialize)]
#[serde(untagged)]
enum TotalHits {
    Object { value: u64 },
    Count(u64),
}

#[derive(Deserialize)]
struct Hit {
    #[serde(rename = "_source")]
    source: LogRecord,
}

#[async_trait]
impl LogSink for OpenSearchSink {
    async fn send(&self, index: &str, record: &LogRecord) -> Result<(), SinkError> {
        let url = self.endpoint(&format!("{}/_doc", index));
        let resp = self.authorize(self.client.post(&url)).json(record).send().await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(error_from(resp).await)
        }
    }

    async fn search(&self, index_pattern: &str, request: &SearchRequest) -> Result<SearchHits, SinkError> {
        let url = self.endpoint(&format!(
            "{}/_search?ignore_unavailable=true&allow_no_indices=true",
            index_pattern
        ));
        let resp = self
            .authorize(self.client.post(&url))
            .json(&self.windowed(request).to_json())
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }

        let bytes = resp.bytes().await?;
        let parsed: SearchResponse = serde_json::from_slice(&bytes)
            .map_err(|e| SinkError::UnexpectedResponse(e.to_string()))?;

        let total = match parsed.hits.total {
            TotalHits::Object { value } | TotalHits::Count(value) => value,
        };
        let records = parsed.hits.hits.into_iter().map(|hit| hit.source).collect();

        Ok(SearchHits { records, total })
    }

    async fn ping(&self) -> Result<bool, SinkError> {
        let resp = self.authorize(self.client.get(self.endpoint(""))).send().await?;
        Ok(resp.status().is_success())
    }
}
