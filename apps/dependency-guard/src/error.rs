//! User-safe service errors and the classifier that produces them.
//!
//! Every error that crosses an HTTP boundary is first passed through
//! [`classify`], which maps a raw failure onto a closed [`ErrorCode`], a
//! numeric status, and a fixed human-readable message. The raw cause is kept
//! for logging and is reachable through [`std::error::Error::source`], but it
//! is never serialized into an [`ErrorResponse`].
//!
//! # Classification Rules
//!
//! Applied in order against the lower-cased error text (first match wins):
//!
//! | # | Text contains | Code | Status |
//! |---|---------------|------|--------|
//! | 1 | `timeout`, `deadline exceeded` | `TIMEOUT` | 408 |
//! | 2 | `connection refused`, `connection reset` | `DEPENDENCY_FAILURE` | 502 |
//! | 3 | `circuit breaker` | `SERVICE_UNAVAILABLE` | 503 |
//! | 4 | `rate limit`, `too many requests` | `TOO_MANY_REQUESTS` | 429 |
//! | 5 | `unauthorized`, `authentication` | `UNAUTHORIZED` | 401 |
//! | 6 | `not found` | `NOT_FOUND` | 404 |
//! | 7 | `bad request`, `invalid` | `BAD_REQUEST` | 400 |
//! | 8 | `service unavailable` | `SERVICE_UNAVAILABLE` | 503 |
//! | 9 | anything else | `INTERNAL_ERROR` | 500 |

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::resilience::{BoxError, is_circuit_open};

/// Machine-readable error codes exposed at system boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The operation or one of its dependencies did not answer in time.
    Timeout,
    /// A dependency could not be reached at the connection level.
    DependencyFailure,
    /// A dependency is unavailable or its circuit is open.
    ServiceUnavailable,
    /// A dependency is rate limiting us.
    TooManyRequests,
    /// Credentials were rejected.
    Unauthorized,
    /// The requested resource does not exist.
    NotFound,
    /// The request was malformed.
    BadRequest,
    /// Anything we could not classify.
    InternalError,
}

impl ErrorCode {
    /// HTTP status code for this error.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::Timeout => 408,
            Self::DependencyFailure => 502,
            Self::ServiceUnavailable => 503,
            Self::TooManyRequests => 429,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::BadRequest => 400,
            Self::InternalError => 500,
        }
    }

    /// Stable string form of the code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::DependencyFailure => "DEPENDENCY_FAILURE",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::TooManyRequests => "TOO_MANY_REQUESTS",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound => "NOT_FOUND",
            Self::BadRequest => "BAD_REQUEST",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Whether a failure with this code is worth retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::DependencyFailure
                | Self::ServiceUnavailable
                | Self::TooManyRequests
        )
    }

    /// Fixed user-facing sentence for this code.
    ///
    /// Parameterized only by the caller's description of the operation; the
    /// raw failure text never reaches this message.
    #[must_use]
    pub fn safe_message(&self, operation: &str) -> String {
        match self {
            Self::Timeout => {
                format!("The {operation} operation took too long to respond. Please try again.")
            }
            Self::DependencyFailure => format!(
                "The {operation} operation could not reach a required service. Please try again shortly."
            ),
            Self::ServiceUnavailable => format!(
                "The {operation} operation is temporarily unavailable. Please try again later."
            ),
            Self::TooManyRequests => format!(
                "The {operation} operation is receiving too many requests. Please wait a moment and try again."
            ),
            Self::Unauthorized => format!("The {operation} operation could not be authorized."),
            Self::NotFound => {
                format!("The {operation} operation could not find the requested resource.")
            }
            Self::BadRequest => format!("The {operation} operation received an invalid request."),
            Self::InternalError => {
                format!("The {operation} operation failed due to an internal error.")
            }
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified, user-safe error.
///
/// Immutable once built. Cloning is cheap: the wrapped cause is shared.
#[derive(Debug, Clone)]
pub struct ServiceError {
    code: ErrorCode,
    message: String,
    context: BTreeMap<String, String>,
    cause: Option<Arc<dyn StdError + Send + Sync>>,
}

impl ServiceError {
    /// Create a service error with an explicit code and safe message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: BTreeMap::new(),
            cause: None,
        }
    }

    /// Attach the internal cause. Kept for logging only.
    #[must_use]
    pub fn with_cause(mut self, cause: BoxError) -> Self {
        self.cause = Some(Arc::from(cause));
        self
    }

    /// Add a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// HTTP status derived from the code.
    #[must_use]
    pub const fn status(&self) -> u16 {
        self.code.status()
    }

    /// User-safe message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Context entries.
    #[must_use]
    pub const fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    /// Convert to the serializable response body.
    #[must_use]
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.code,
            message: self.message.clone(),
            status: self.status(),
            details: self.context.clone(),
        }
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl StdError for ServiceError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        if let Some(cause) = self.source() {
            tracing::debug!(code = %self.code, cause = %cause, "Returning classified error");
        }
        let status =
            StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_response())).into_response()
    }
}

/// HTTP error response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// User-safe message.
    pub message: String,
    /// HTTP status.
    pub status: u16,
    /// Caller-supplied context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

/// Ordered text-matching rules. Order is part of the contract.
const RULES: &[(&[&str], ErrorCode)] = &[
    (&["timeout", "deadline exceeded"], ErrorCode::Timeout),
    (
        &["connection refused", "connection reset"],
        ErrorCode::DependencyFailure,
    ),
    (&["circuit breaker"], ErrorCode::ServiceUnavailable),
    (&["rate limit", "too many requests"], ErrorCode::TooManyRequests),
    (&["unauthorized", "authentication"], ErrorCode::Unauthorized),
    (&["not found"], ErrorCode::NotFound),
    (&["bad request", "invalid"], ErrorCode::BadRequest),
    (&["service unavailable"], ErrorCode::ServiceUnavailable),
];

/// Classify a raw failure into a [`ServiceError`].
///
/// A `ServiceError` passes through unchanged. A `ServiceError` found further
/// down the source chain is returned as-is as well, so structured codes set by
/// a collaborator win over text matching. A circuit-open rejection is always
/// `SERVICE_UNAVAILABLE`, whatever the breaker is named. Everything else is
/// matched against the ordered rules above.
#[must_use]
pub fn classify(raw: BoxError, operation: &str) -> ServiceError {
    let raw = match raw.downcast::<ServiceError>() {
        Ok(service_error) => return *service_error,
        Err(raw) => raw,
    };

    if let Some(inner) = error_chain(&*raw)
        .skip(1)
        .find_map(|e| e.downcast_ref::<ServiceError>())
    {
        return inner.clone();
    }

    let code = if is_circuit_open(&*raw) {
        ErrorCode::ServiceUnavailable
    } else {
        classify_text(&chain_text(&*raw))
    };
    tracing::debug!(
        operation,
        code = %code,
        cause = %raw,
        "Classified dependency error"
    );

    ServiceError::new(code, code.safe_message(operation)).with_cause(raw)
}

/// Match error text against the ordered rules.
#[must_use]
pub fn classify_text(text: &str) -> ErrorCode {
    let lower = text.to_lowercase();
    RULES
        .iter()
        .find(|(needles, _)| needles.iter().any(|needle| lower.contains(needle)))
        .map_or(ErrorCode::InternalError, |(_, code)| *code)
}

/// Iterate an error and all of its sources.
pub(crate) fn error_chain<'a>(
    error: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(error), |e| (*e).source())
}

fn chain_text(error: &(dyn StdError + 'static)) -> String {
    error_chain(error)
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}
