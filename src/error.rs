//! Error types for the Sigma metadata extractor.

/// Errors that can occur while crawling the Sigma API.
///
/// Variants carry stringified causes rather than source errors so the enum
/// stays `Clone`; the single-flight fetch cache hands a resolved failure to
/// every caller that was awaiting the same request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The token request was rejected.
    #[error("authentication failed with status {status}: {body}")]
    Auth { status: u16, body: String },
    /// Any other non-2xx API response.
    #[error("Sigma API error with status {status}: {body}")]
    Http { status: u16, body: String },
    /// Transport-level failure issuing a request.
    #[error("HTTP request failed: {0}")]
    Request(String),
    /// A response body did not match the expected shape.
    #[error("failed to parse response: {0}")]
    Parse(String),
    /// A workbook query contained SQL the parser rejected.
    #[error("failed to parse query SQL: {0}")]
    Sql(String),
    /// Failure setting up the blocking runtime in the defs loader.
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Result type alias for extractor operations.
pub type Result<T> = std::result::Result<T, Error>;
