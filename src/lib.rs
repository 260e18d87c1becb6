pub mod record;
pub mod error;
pub mod sink;
pub mod query;
pub mod index;
pub mod dispatcher;
pub mod capture;
pub mod middleware;
pub mod health;
pub mod api;

#[cfg(feature = "opensearch")]
pub mod opensearch;

pub mod memory;
pub mod backend;
pub mod config;
pub mod init;
pub mod pipeline;

pub use middleware::{AuditLayer, Principal, RequestId};
pub use pipeline::AuditPipeline;
pub use record::LogRecord;
