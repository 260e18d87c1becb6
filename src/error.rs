/// Error returned by a [`LogSink`](crate::sink::LogSink) talking to the
/// search backend.
///
/// None of these ever reach an HTTP caller: the index writer and the
/// dispatcher log them and move on.
#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[cfg(feature = "opensearch")]
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("search backend is unavailable")]
    Unavailable,

    #[error("unexpected backend response: {0}")]
    UnexpectedResponse(String),
}
