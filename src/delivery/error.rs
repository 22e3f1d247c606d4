//! Error types for HTTP delivery

use thiserror::Error;

/// Result type for delivery operations
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Errors raised while delivering a batch to one endpoint
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// HTTP client could not be constructed
    #[error("Failed to create HTTP client: {0}")]
    Client(String),

    /// Endpoint is not a usable URL
    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    /// Connection or transport failure
    #[error("Request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// No response within the per-request deadline
    #[error("Request to {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },

    /// Endpoint answered with a status worth retrying (5xx, 408, 429)
    #[error("{endpoint} responded with HTTP {status}")]
    Status { endpoint: String, status: u16 },

    /// Endpoint refused the batch itself (4xx); retrying cannot help
    #[error("{endpoint} rejected the batch with HTTP {status}")]
    Rejected { endpoint: String, status: u16 },

    /// Delivery task ended without producing a result
    #[error("Delivery to {endpoint} aborted: {reason}")]
    Aborted { endpoint: String, reason: String },
}

impl DeliveryError {
    /// Whether another attempt against the same endpoint may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Request { .. } | Self::Timeout { .. } | Self::Status { .. }
        )
    }

    /// HTTP status carried by the error, if the endpoint responded
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } | Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify a non-success response
    pub fn from_status(endpoint: &str, status: reqwest::StatusCode) -> Self {
        let bail = status.is_client_error()
            && status != reqwest::StatusCode::REQUEST_TIMEOUT
            && status != reqwest::StatusCode::TOO_MANY_REQUESTS;

        if bail {
            Self::Rejected {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            }
        } else {
            Self::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            }
        }
    }
}
