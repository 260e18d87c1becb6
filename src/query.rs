//! Query AST for the audit trail and the builder that compiles search
//! filters into it.
//!
//! The AST is rendered to the OpenSearch query DSL by [`Query::to_json`]
//! and evaluated directly by the in-memory store through
//! [`Query::matches`], so both backends agree on what a filter means.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Deserializer};
use std::fmt::Display;
use std::str::FromStr;
use serde_json::{json, Value};

use crate::record::LogRecord;

pub const DEFAULT_PAGE_NUMBER: u32 = 1;
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Searchable fields of a [`LogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    RequestId,
    UserId,
    Method,
    Path,
    Timestamp,
    StatusCode,
}

impl Field {
    /// Document field name as serialized in the backend.
    pub fn name(self) -> &'static str {
        match self {
            Field::RequestId => "requestId",
            Field::UserId => "userId",
            Field::Method => "method",
            Field::Path => "path",
            Field::Timestamp => "timestamp",
            Field::StatusCode => "statusCode",
        }
    }

    /// Path used for exact and wildcard matching. Dynamically mapped
    /// strings are analyzed text, so those go through `.keyword`.
    fn exact_path(self) -> String {
        match self {
            Field::Timestamp | Field::StatusCode => self.name().to_string(),
            _ => format!("{}.keyword", self.name()),
        }
    }

    fn text_of(self, record: &LogRecord) -> Option<&str> {
        match self {
            Field::RequestId => Some(&record.request_id),
            Field::UserId => record.user_id.as_deref(),
            Field::Method => Some(&record.method),
            Field::Path => Some(&record.path),
            Field::Timestamp | Field::StatusCode => None,
        }
    }
}

/// Bound of a [`Query::Range`] clause.
#[derive(Debug, Clone, PartialEq)]
pub enum RangeValue {
    Time(DateTime<Utc>),
    Int(i64),
}

impl RangeValue {
    fn to_json(&self) -> Value {
        match self {
            RangeValue::Time(t) => Value::String(t.to_rfc3339()),
            RangeValue::Int(n) => Value::from(*n),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    MatchAll,
    Term { field: Field, value: String },
    /// Substring match: `value` is matched anywhere in the field.
    Wildcard { field: Field, value: String },
    /// Inclusive range; a missing bound is open.
    Range {
        field: Field,
        gte: Option<RangeValue>,
        lte: Option<RangeValue>,
    },
    And(Vec<Query>),
}

impl Query {
    /// Render as an OpenSearch query DSL object.
    pub fn to_json(&self) -> Value {
        match self {
            Query::MatchAll => json!({ "match_all": {} }),
            Query::Term { field, value } => {
                let path = field.exact_path();
                json!({ "term": { path: { "value": value } } })
            }
            Query::Wildcard { field, value } => {
                let path = field.exact_path();
                let pattern = format!("*{}*", escape_wildcard(value));
                json!({ "wildcard": { path: { "value": pattern } } })
            }
            Query::Range { field, gte, lte } => {
                let mut bounds = serde_json::Map::new();
                if let Some(gte) = gte {
                    bounds.insert("gte".to_string(), gte.to_json());
                }
                if let Some(lte) = lte {
                    bounds.insert("lte".to_string(), lte.to_json());
                }
                let name = field.name();
                json!({ "range": { name: bounds } })
            }
            Query::And(clauses) => json!({
                "bool": { "must": clauses.iter().map(Query::to_json).collect::<Vec<_>>() }
            }),
        }
    }

    /// Evaluate the query against a record held in memory.
    pub fn matches(&self, record: &LogRecord) -> bool {
        match self {
            Query::MatchAll => true,
            Query::Term { field, value } => field.text_of(record) == Some(value.as_str()),
            Query::Wildcard { field, value } => field
                .text_of(record)
                .map_or(false, |text| text.contains(value.as_str())),
            Query::Range { field, gte, lte } => {
                in_range(*field, record, gte.as_ref(), lte.as_ref())
            }
            Query::And(clauses) => clauses.iter().all(|q| q.matches(record)),
        }
    }
}

fn in_range(field: Field, record: &LogRecord, gte: Option<&RangeValue>, lte: Option<&RangeValue>) -> bool {
    let above = |bound: &RangeValue| match (field, bound) {
        (Field::Timestamp, RangeValue::Time(t)) => record.timestamp >= *t,
        (Field::StatusCode, RangeValue::Int(n)) => i64::from(record.status_code) >= *n,
        _ => false,
    };
    let below = |bound: &RangeValue| match (field, bound) {
        (Field::Timestamp, RangeValue::Time(t)) => record.timestamp <= *t,
        (Field::StatusCode, RangeValue::Int(n)) => i64::from(record.status_code) <= *n,
        _ => false,
    };
    gte.map_or(true, above) && lte.map_or(true, below)
}

fn escape_wildcard(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Filters accepted by the audit search endpoint.
///
/// Every field is optional; empty strings count as absent. Dates accept
/// RFC 3339 or a bare `YYYY-MM-DD`, which covers the whole day.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditLogFilter {
    pub user_id: Option<String>,
    /// HTTP method, matched case-insensitively.
    pub action: Option<String>,
    pub path: Option<String>,
    #[serde(deserialize_with = "form::start_of_day")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "form::end_of_day")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "form::number")]
    pub min_status_code: Option<u16>,
    #[serde(deserialize_with = "form::number")]
    pub max_status_code: Option<u16>,
    #[serde(deserialize_with = "form::number")]
    pub page_number: Option<u32>,
    #[serde(deserialize_with = "form::number")]
    pub page_size: Option<u32>,
}

/// Query-string field parsers where a blank value means "not supplied".
mod form {
    use super::*;
    use serde::de::Error;

    fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        let value = Option::<String>::deserialize(deserializer)?;
        Ok(value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()))
    }

    pub fn number<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: FromStr,
        T::Err: Display,
    {
        present(deserializer)?
            .map(|v| v.parse().map_err(D::Error::custom))
            .transpose()
    }

    pub fn start_of_day<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        present(deserializer)?
            .map(|v| parse_date(&v, NaiveTime::MIN).map_err(D::Error::custom))
            .transpose()
    }

    pub fn end_of_day<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let last_instant = NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999)
            .ok_or_else(|| D::Error::custom("invalid end of day"))?;
        present(deserializer)?
            .map(|v| parse_date(&v, last_instant).map_err(D::Error::custom))
            .transpose()
    }

    fn parse_date(value: &str, time_of_day: NaiveTime) -> Result<DateTime<Utc>, String> {
        if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
            return Ok(instant.with_timezone(&Utc));
        }
        NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(|day| day.and_time(time_of_day).and_utc())
            .map_err(|_| format!("invalid date {:?}, expected RFC 3339 or YYYY-MM-DD", value))
    }
}

/// A compiled, paginated search over every audit partition.
///
/// Results are always ordered by `timestamp`, most recent first.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: Query,
    pub from: usize,
    pub size: usize,
}

impl SearchRequest {
    pub fn new(query: Query, from: usize, size: usize) -> Self {
        SearchRequest { query, from, size }
    }

    /// Full `_search` request body.
    pub fn to_json(&self) -> Value {
        let sort_field = Field::Timestamp.name();
        json!({
            "query": self.query.to_json(),
            "sort": [{ sort_field: { "order": "desc" } }],
            "from": self.from,
            "size": self.size,
            "track_total_hits": true,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Compile filters into a single query: one clause per supplied filter,
/// all required to match. No filters yields [`Query::MatchAll`].
pub fn build_query(filter: &AuditLogFilter) -> Query {
    let mut clauses = Vec::new();

    if let Some(user_id) = non_empty(&filter.user_id) {
        clauses.push(Query::Term { field: Field::UserId, value: user_id.to_string() });
    }
    if let Some(action) = non_empty(&filter.action) {
        clauses.push(Query::Term { field: Field::Method, value: action.to_uppercase() });
    }
    if let Some(path) = non_empty(&filter.path) {
        clauses.push(Query::Wildcard { field: Field::Path, value: path.to_string() });
    }
    if filter.start_date.is_some() || filter.end_date.is_some() {
        clauses.push(Query::Range {
            field: Field::Timestamp,
            gte: filter.start_date.map(RangeValue::Time),
            lte: filter.end_date.map(RangeValue::Time),
        });
    }
    if filter.min_status_code.is_some() || filter.max_status_code.is_some() {
        clauses.push(Query::Range {
            field: Field::StatusCode,
            gte: filter.min_status_code.map(|c| RangeValue::Int(c.into())),
            lte: filter.max_status_code.map(|c| RangeValue::Int(c.into())),
        });
    }

    if clauses.is_empty() {
        Query::MatchAll
    } else {
        Query::And(clauses)
    }
}

/// Compile filters and pagination into a [`SearchRequest`].
pub fn build_search(filter: &AuditLogFilter) -> SearchRequest {
    let page_number = filter.page_number.unwrap_or(DEFAULT_PAGE_NUMBER).max(1) as usize;
    let page_size = filter
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE) as usize;

    SearchRequest::new(build_query(filter), (page_number - 1) * page_size, page_size)
}

/// Exact lookup of one call by its request id.
pub fn by_request_id(request_id: &str) -> SearchRequest {
    SearchRequest::new(
        Query::Term { field: Field::RequestId, value: request_id.to_string() },
        0,
        1,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(method: &str, path: &str, status: u16) -> LogRecord {
        let mut r = LogRecord::new("id", method, path);
        r.status_code = status;
        r
    }

    #[test]
    fn no_filters_match_everything() {
        let search = build_search(&AuditLogFilter::default());
        assert_eq!(search.query, Query::MatchAll);
        assert_eq!(search.from, 0);
        assert_eq!(search.size, DEFAULT_PAGE_SIZE as usize);
        assert_eq!(search.to_json()["query"], json!({ "match_all": {} }));
    }

    #[test]
    fn blank_strings_are_ignored() {
        let filter = AuditLogFilter {
            user_id: Some(String::new()),
            path: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(build_query(&filter), Query::MatchAll);
    }

    #[test]
    fn action_is_upper_cased() {
        let filter = AuditLogFilter { action: Some("get".to_string()), ..Default::default() };
        let query = build_query(&filter);
        assert_eq!(
            query,
            Query::And(vec![Query::Term { field: Field::Method, value: "GET".to_string() }])
        );
        assert!(query.matches(&record("GET", "/", 200)));
        assert!(!query.matches(&record("POST", "/", 200)));
    }

    #[test]
    fn clauses_are_anded_in_filter_order() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let filter = AuditLogFilter {
            user_id: Some("u-1".to_string()),
            path: Some("companies".to_string()),
            start_date: Some(start),
            min_status_code: Some(200),
            max_status_code: Some(299),
            ..Default::default()
        };

        let rendered = build_query(&filter).to_json();
        let must = rendered["bool"]["must"].as_array().unwrap();
        assert_eq!(must.len(), 4);
        assert_eq!(must[0], json!({ "term": { "userId.keyword": { "value": "u-1" } } }));
        assert_eq!(must[1], json!({ "wildcard": { "path.keyword": { "value": "*companies*" } } }));
        assert_eq!(must[2], json!({ "range": { "timestamp": { "gte": start.to_rfc3339() } } }));
        assert_eq!(must[3], json!({ "range": { "statusCode": { "gte": 200, "lte": 299 } } }));
    }

    #[test]
    fn status_range_is_inclusive() {
        let filter = AuditLogFilter {
            min_status_code: Some(200),
            max_status_code: Some(299),
            ..Default::default()
        };
        let query = build_query(&filter);
        assert!(query.matches(&record("GET", "/", 200)));
        assert!(query.matches(&record("GET", "/", 299)));
        assert!(!query.matches(&record("GET", "/", 300)));
        assert!(!query.matches(&record("GET", "/", 199)));
    }

    #[test]
    fn path_is_a_substring_match_with_escaped_metacharacters() {
        let query = Query::Wildcard { field: Field::Path, value: "a*b".to_string() };
        assert_eq!(query.to_json()["wildcard"]["path.keyword"]["value"], "*a\\*b*");
        assert!(query.matches(&record("GET", "/x/a*b/y", 200)));
        assert!(!query.matches(&record("GET", "/x/ab/y", 200)));
    }

    #[test]
    fn pagination_offsets_and_clamps() {
        let filter = AuditLogFilter { page_number: Some(2), page_size: Some(10), ..Default::default() };
        let search = build_search(&filter);
        assert_eq!((search.from, search.size), (10, 10));

        let filter = AuditLogFilter { page_number: Some(0), page_size: Some(0), ..Default::default() };
        let search = build_search(&filter);
        assert_eq!((search.from, search.size), (0, 1));

        let body = build_search(&AuditLogFilter::default()).to_json();
        assert_eq!(body["sort"], json!([{ "timestamp": { "order": "desc" } }]));
    }

    fn parse_filter(uri: &str) -> AuditLogFilter {
        let uri: axum::http::Uri = uri.parse().unwrap();
        axum::extract::Query::<AuditLogFilter>::try_from_uri(&uri).unwrap().0
    }

    #[test]
    fn blank_form_fields_are_absent() {
        let filter = parse_filter(
            "/api/audit-logs?startDate=&endDate=&minStatusCode=&maxStatusCode=&pageNumber=&pageSize=&action=get",
        );
        assert_eq!(filter.start_date, None);
        assert_eq!(filter.end_date, None);
        assert_eq!(filter.min_status_code, None);
        assert_eq!(filter.page_size, None);
        assert_eq!(
            build_query(&filter),
            Query::And(vec![Query::Term { field: Field::Method, value: "GET".to_string() }])
        );
    }

    #[test]
    fn bare_dates_cover_whole_days() {
        let filter = parse_filter("/?startDate=2026-01-01&endDate=2026-01-31&pageSize=10");
        assert_eq!(filter.start_date, Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let end = filter.end_date.unwrap();
        assert!(end > Utc.with_ymd_and_hms(2026, 1, 31, 23, 59, 59).unwrap());
        assert!(end < Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(filter.page_size, Some(10));

        let filter = parse_filter("/?startDate=2026-01-01T08:30:00%2B02:00");
        assert_eq!(filter.start_date, Some(Utc.with_ymd_and_hms(2026, 1, 1, 6, 30, 0).unwrap()));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let uri: axum::http::Uri = "/?minStatusCode=abc".parse().unwrap();
        assert!(axum::extract::Query::<AuditLogFilter>::try_from_uri(&uri).is_err());
        let uri: axum::http::Uri = "/?startDate=yesterday".parse().unwrap();
        assert!(axum::extract::Query::<AuditLogFilter>::try_from_uri(&uri).is_err());
    }

    #[test]
    fn user_term_does_not_match_anonymous_records() {
        let query = Query::Term { field: Field::UserId, value: "u-1".to_string() };
        assert!(!query.matches(&record("GET", "/", 200)));
    }
}
