//! Error types for LFS transfer operations.

use std::time::Duration;
use thiserror::Error;

/// Result type for LFS transfer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while moving LFS objects.
#[derive(Error, Debug)]
pub enum Error {
    /// A transient failure; the whole object may be submitted again.
    #[error("{0} (retriable)")]
    Retriable(Box<Error>),

    /// The server asked for the object to be tried again after a delay.
    #[error("{inner} (retry after {}s)", .after.as_secs())]
    RetriableLater { inner: Box<Error>, after: Duration },

    /// Malformed handshake, status or framing on an SSH connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Downloaded content does not hash to the expected OID.
    #[error("expected OID {expected}, got {actual} after {written} bytes written")]
    Integrity {
        expected: String,
        actual: String,
        written: u64,
    },

    /// Invalid adapter configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// OID parsing error
    #[error("invalid OID: {0}")]
    InvalidOid(String),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(String),

    /// Server returned an error
    #[error("LFS server error: {message} (code: {code})")]
    ServerError { code: u16, message: String },

    /// Object not found on server
    #[error("object not found: {0}")]
    NotFound(String),

    /// Authentication required
    #[error("authentication required")]
    AuthRequired,

    /// Invalid URL
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// `add` was called outside of `begin`/`end`.
    #[error("transfer adapter {0:?} has not been started")]
    AdapterNotStarted(String),

    /// External transfer process failure.
    #[error("transfer process error: {0}")]
    Process(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl Error {
    /// Wrap an error so callers know the object can be tried again.
    pub fn retriable(err: impl Into<Error>) -> Self {
        match err.into() {
            e @ (Error::Retriable(_) | Error::RetriableLater { .. }) => e,
            e => Error::Retriable(Box::new(e)),
        }
    }

    /// Wrap an error so callers retry the object once `after` has passed.
    pub fn retriable_later(err: impl Into<Error>, after: Duration) -> Self {
        let inner = match err.into() {
            Error::Retriable(inner) => inner,
            Error::RetriableLater { inner, .. } => inner,
            e => Box::new(e),
        };
        Error::RetriableLater { inner, after }
    }

    /// Whether the caller may re-submit the object.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Retriable(_) | Error::RetriableLater { .. })
    }

    /// How long the server asked to wait before the object is retried.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RetriableLater { after, .. } => Some(*after),
            _ => None,
        }
    }

    /// Whether this is an SSH protocol failure.
    pub fn is_protocol(&self) -> bool {
        match self {
            Error::Protocol(_) => true,
            Error::Retriable(inner) | Error::RetriableLater { inner, .. } => inner.is_protocol(),
            _ => false,
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }

    /// Convert into an `io::Error` so it can cross a `Read`/`Write` boundary.
    pub(crate) fn into_io(self) -> std::io::Error {
        match self {
            Error::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }

    /// Recover an error previously passed through [`Error::into_io`].
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        if !err.get_ref().map_or(false, |inner| inner.is::<Error>()) {
            return Error::Io(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(e)) => *e,
            Some(Err(inner)) => Error::Io(std::io::Error::new(kind, inner)),
            None => Error::Io(kind.into()),
        }
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(401, _) | ureq::Error::Status(403, _) => Error::AuthRequired,
            ureq::Error::Status(404, _) => Error::NotFound("object not found".into()),
            ureq::Error::Status(code, response) => {
                let message = response
                    .into_string()
                    .unwrap_or_else(|_| "unknown error".into());
                Error::ServerError { code, message }
            }
            other => Error::Http(other.to_string()),
        }
    }
}
