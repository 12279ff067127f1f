//! Error taxonomy shared across the broker.
//!
//! Every error carries an HTTP mapping so the handlers can render it without
//! inspecting the failure site. WebDriver surfaces additionally wrap errors
//! into the W3C error body shape (see [`W3cError`]).

use axum::http::StatusCode;

/// Marker status for requests that were abandoned by the client while a
/// session create was in flight. Never actually written to the wire.
pub const STATUS_REQUEST_CANCELED: u16 = 499;

/// W3C error tag used when a session could not be created.
pub const SESSION_NOT_CREATED: &str = "session not created";
/// W3C error tag used when the capabilities payload failed to parse.
pub const BAD_SESSION_PARAMETERS: &str = "bad session parameters";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown browser/flavor/version, malformed capabilities or query.
    #[error("{reason}")]
    BadRequest { reason: String },

    /// Unknown session id.
    #[error("{reason}")]
    NotFound { reason: String },

    /// Quota queue full or the reserve wait timed out.
    #[error("{reason}")]
    QuotaExceeded { reason: String },

    /// Allocator or readiness deadline exceeded.
    #[error("{reason}")]
    GatewayTimeout { reason: String },

    /// Requested side port not present on the workload.
    #[error("{reason}")]
    ServiceUnavailable { reason: String },

    /// Client went away while the request was in flight.
    #[error("{reason}")]
    Canceled { reason: String },

    /// Session storage refused the operation because it is draining.
    #[error("session storage is shut down")]
    StorageShutdown,

    /// Everything else: backend failures, unexpected upstream responses.
    #[error("{reason}")]
    Internal { reason: String },
}

impl Error {
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Error::BadRequest {
            reason: reason.into(),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Error::NotFound {
            reason: reason.into(),
        }
    }

    pub fn quota_exceeded(reason: impl Into<String>) -> Self {
        Error::QuotaExceeded {
            reason: reason.into(),
        }
    }

    pub fn gateway_timeout(reason: impl Into<String>) -> Self {
        Error::GatewayTimeout {
            reason: reason.into(),
        }
    }

    pub fn service_unavailable(reason: impl Into<String>) -> Self {
        Error::ServiceUnavailable {
            reason: reason.into(),
        }
    }

    pub fn canceled(reason: impl Into<String>) -> Self {
        Error::Canceled {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Error::Internal {
            reason: reason.into(),
        }
    }

    /// HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Canceled { .. } => {
                StatusCode::from_u16(STATUS_REQUEST_CANCELED).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Error::StorageShutdown | Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wrap an elapsed create deadline, preserving an already-classified error.
    pub fn wrap_timeout(self, msg: &str) -> Self {
        match self {
            Error::GatewayTimeout { reason } => Error::GatewayTimeout {
                reason: format!("{msg}: {reason}"),
            },
            other => other,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Body of a W3C-shaped error response:
/// `{"value":{"error":...,"message":...,"stacktrace":...}}`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct W3cErrorBody {
    pub error: String,
    pub message: String,
    pub stacktrace: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct W3cError {
    pub value: W3cErrorBody,
}

impl W3cError {
    pub fn new(tag: &str, err: &Error) -> Self {
        let message = err.to_string();
        W3cError {
            value: W3cErrorBody {
                error: tag.to_string(),
                stacktrace: message.clone(),
                message,
            },
        }
    }
}
