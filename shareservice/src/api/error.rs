//! API error handling.
//!
//! Errors are rendered for the caller: the photobooth gets plain text, JSON
//! clients get a JSON body and browsers get a small HTML page.

use axum::{
    Json,
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use serde::Serialize;

use crate::error::Error;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Whether repeating the request may succeed
    pub retryable: bool,
}

/// How an error is presented to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorFormat {
    #[default]
    Text,
    Json,
    Html,
}

impl ErrorFormat {
    /// Pick the format from the action and the caller's `Accept` header.
    ///
    /// `download` is opened by a browser from a QR code, so it always gets HTML.
    pub fn negotiate(action: Option<&str>, headers: &HeaderMap) -> Self {
        if action == Some("download") {
            return Self::Html;
        }
        let accept = headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if accept.contains("text/html") {
            Self::Html
        } else if accept.contains("application/json") {
            Self::Json
        } else {
            Self::Text
        }
    }
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub format: ErrorFormat,
}

impl ApiError {
    /// Create a new API error.
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            retryable: false,
            format: ErrorFormat::Text,
        }
    }

    pub fn with_format(mut self, format: ErrorFormat) -> Self {
        self.format = format;
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    /// Create a 406 for actions the endpoint does not know.
    pub fn not_acceptable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_ACCEPTABLE, "UNKNOWN_ACTION", message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", message)
    }

    fn render_html(&self) -> String {
        format!(
            "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
             <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
             <title>Error</title>\n</head>\n<body>\n<h1>Sorry, something went wrong</h1>\n\
             <p>{}</p>\n</body>\n</html>\n",
            escape_html(&self.message)
        )
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.format {
            ErrorFormat::Html => (self.status, Html(self.render_html())).into_response(),
            ErrorFormat::Json => {
                let body = ApiErrorResponse {
                    code: self.code,
                    message: self.message,
                    retryable: self.retryable,
                };
                (self.status, Json(body)).into_response()
            }
            ErrorFormat::Text => (
                self.status,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                format!("runtime error: {}", self.message),
            )
                .into_response(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound { entity_type, id } => {
                ApiError::not_found(format!("{} '{}' not found", entity_type, id))
            }
            Error::Validation(msg) => ApiError::validation(msg),
            Error::PayloadTooLarge { .. } => ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                "The file is too large",
            ),
            Error::UnsupportedMediaType(mime) => ApiError::new(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "UNSUPPORTED_MEDIA_TYPE",
                format!("File not allowed ({})", mime),
            ),
            Error::Unauthorized(msg) => ApiError::unauthorized(msg),
            Error::Configuration(msg) => {
                tracing::error!("Configuration error: {}", msg);
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "CONFIGURATION_ERROR", msg)
            }
            err @ Error::Timeout(_) => {
                ApiError::new(StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", err.to_string())
            }
            err @ Error::UploadFailed(_) => {
                ApiError::new(StatusCode::BAD_GATEWAY, "UPLOAD_FAILED", err.to_string())
            }
            Error::StoreBusy(op) => {
                tracing::warn!("Job store busy during {}", op);
                let mut api_err =
                    ApiError::service_unavailable("The job store is busy, please retry");
                api_err.retryable = true;
                api_err
            }
            Error::InvalidStateTransition { from, to } => {
                ApiError::conflict(format!("Cannot transition from {} to {}", from, to))
            }
            Error::DatabaseSqlx(e) => {
                tracing::error!("Database error: {}", e);
                ApiError::internal("Database error occurred")
            }
            err @ (Error::Io(_) | Error::IoPath { .. }) => {
                tracing::error!("IO error: {}", err);
                ApiError::internal("Error processing the file")
            }
            _ => {
                tracing::error!("Unexpected error: {}", err);
                ApiError::internal("An unexpected error occurred")
            }
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
