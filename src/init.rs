use std::str::FromStr;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Console output format of the process-wide subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {:?}", other)),
        }
    }
}

/// Settings for the local diagnostic log.
///
/// This is where the audit pipeline reports its own failures (dropped
/// records, unreachable backend); it is never routed through the
/// pipeline itself.
///
/// **Fields**
/// - `format`: human-readable or one JSON object per line.
/// - `filter`: `EnvFilter` directive, e.g. `info,http_audit_log=debug`.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    pub format: LogFormat,
    pub filter: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            filter: "info".to_string(),
        }
    }
}

/// Install the global `tracing` subscriber described by `config`.
///
/// An invalid filter directive falls back to `info`.
pub fn init_tracing(config: &TracingConfig) -> Result<(), SetGlobalDefaultError> {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));

    // The two formats produce different layer types, so the subscriber is
    // assembled per branch.
    match config.format {
        LogFormat::Json => {
            let subscriber = Registry::default()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json());
            tracing::subscriber::set_global_default(subscriber)
        }
        LogFormat::Pretty => {
            let subscriber = Registry::default()
                .with(filter)
                .with(tracing_subscriber::fmt::layer());
            tracing::subscriber::set_global_default(subscriber)
        }
    }
}
