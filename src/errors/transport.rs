use thiserror::Error;

/// HTTP transport errors.
///
/// A `Status` error keeps the response code so that callers can distinguish
/// "absent" (a 404 on an idempotent delete, safe to ignore) from "failed"
/// (anything else, which must propagate).
#[derive(Error, Debug)]
pub enum TransportError {
    /// The request never produced a response (connection refused, DNS, TLS, ...)
    #[error("{method} {url} failed: {reason}")]
    Connection {
        method: String,
        url: String,
        reason: String,
    },

    /// The server answered with a non-success status code
    #[error("{method} {url} returned HTTP {status}")]
    Status {
        method: String,
        url: String,
        status: u16,
    },

    /// The response body could not be decoded as expected
    #[error("unexpected response body from {url}: {reason}")]
    Decode { url: String, reason: String },
}

impl TransportError {
    /// Response status code, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when the error means the remote resource does not exist.
    pub fn is_missing(&self) -> bool {
        self.status() == Some(404)
    }

    /// True when the error looks like a credentials problem.
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}
