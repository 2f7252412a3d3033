use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy for the acquisition pipeline.
///
/// Every variant is created where the failure happens, so callers never have
/// to guess the class of an error from its message.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing or malformed caller input (URL, format, quality).
    #[error("{0}")]
    InvalidInput(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("No internet connection. Please check your network and try again.")]
    Offline,

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    /// 5xx from a remote service.
    #[error("Service error ({status}): {message}")]
    Service { status: u16, message: String },

    #[error("Rate limited by upstream service")]
    RateLimited { retry_after: Option<Duration> },

    /// 4xx (other than 429) from a remote service.
    #[error("{message}")]
    Upstream { status: u16, message: String },

    /// The extractor process ran but failed.
    #[error("Extractor failed: {0}")]
    Extractor(String),

    #[error("Extractor not available: {0}")]
    ToolMissing(String),

    #[error("Invalid extractor output: {0}")]
    Parse(String),

    #[error("Daily download limit of {limit} reached. Upgrade to premium for unlimited downloads!")]
    QuotaExceeded { limit: u32 },

    #[error("{quality} quality is only available for premium users")]
    TierRestricted { quality: String },

    /// The entitlement store could not be read or written.
    #[error("Failed to fetch download stats: {0}")]
    Backend(String),

    #[error("Download interrupted: lost internet connection after {bytes_downloaded} bytes")]
    Interrupted { bytes_downloaded: u64 },

    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("I/O error: {0}")]
    Io(String),
}

impl PipelineError {
    /// Stable, machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::UnsupportedPlatform(_) => "unsupported_platform",
            Self::Offline => "offline",
            Self::Timeout(_) => "timeout",
            Self::Network(_) => "network",
            Self::Service { .. } => "service_unavailable",
            Self::RateLimited { .. } => "rate_limited",
            Self::Upstream { .. } => "upstream_rejected",
            Self::Extractor(_) => "extractor_failed",
            Self::ToolMissing(_) => "extractor_missing",
            Self::Parse(_) => "invalid_output",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::TierRestricted { .. } => "tier_restricted",
            Self::Backend(_) => "entitlement_backend",
            Self::Interrupted { .. } => "interrupted",
            Self::Exhausted { .. } => "retries_exhausted",
            Self::Io(_) => "io",
        }
    }

    /// Whether the backoff executor may try the operation again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Network(_)
                | Self::Service { .. }
                | Self::RateLimited { .. }
                | Self::Extractor(_)
                | Self::Backend(_)
        )
    }

    /// Failures that no amount of retrying can change.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_)
                | Self::UnsupportedPlatform(_)
                | Self::Offline
                | Self::Upstream { .. }
                | Self::ToolMissing(_)
                | Self::Parse(_)
                | Self::QuotaExceeded { .. }
                | Self::TierRestricted { .. }
                | Self::Io(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classifies an HTTP status returned by a remote endpoint.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => Self::RateLimited { retry_after: None },
            500..=599 => Self::Service { status, message },
            _ => Self::Upstream { status, message },
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::Parse(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), err.to_string())
        } else if err.is_builder() {
            Self::InvalidInput(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

// HTTP-facing error returned by every handler.
pub enum AppError {
    Internal(anyhow::Error),
    BadRequest(String),
    TooManyRequests { message: String, retry_after: Duration },
    Pipeline(PipelineError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, reason, retry_after) = match self {
            AppError::Internal(e) => {
                tracing::error!("Internal server error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred".to_string(),
                    None,
                    None,
                )
            }
            AppError::BadRequest(e) => (StatusCode::BAD_REQUEST, e, Some("invalid_input"), None),
            AppError::TooManyRequests { message, retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                message,
                Some("rate_limited"),
                Some(retry_after),
            ),
            AppError::Pipeline(e) => {
                let status = match &e {
                    PipelineError::InvalidInput(_) | PipelineError::UnsupportedPlatform(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    PipelineError::QuotaExceeded { .. } | PipelineError::TierRestricted { .. } => {
                        StatusCode::FORBIDDEN
                    }
                    _ => {
                        tracing::error!(reason = e.reason(), "Pipeline failure: {}", e);
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.to_string(), Some(e.reason()), None)
            }
        };

        let body = Json(json!({ "error": error_message, "reason": reason }));
        let mut response = (status, body).into_response();
        if let Some(wait) = retry_after {
            // Round up so clients never retry before the window opens.
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        Self::Pipeline(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}
