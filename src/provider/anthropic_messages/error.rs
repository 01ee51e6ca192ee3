use serde::Deserialize;

use crate::error::{ApiError, ErrorKind, classify_status};

/// Parses error responses returned by the Anthropic Messages API.
///
/// Anthropic wraps errors as `{"type":"error","error":{"type":...,"message":...}}`; the
/// inner `type` refines the status-based kind.
pub(crate) fn parse_anthropic_error(status: u16, body: &str) -> ApiError {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<InnerError>,
    }

    #[derive(Deserialize)]
    struct InnerError {
        message: Option<String>,
        r#type: Option<String>,
    }

    let Some(error) = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.error)
    else {
        return ApiError::from_status(status, format!("status {status}: {}", body.trim()), body);
    };

    let message = error.message.unwrap_or_else(|| "unknown error".to_string());
    let kind = match error.r#type.as_deref() {
        Some("authentication_error" | "permission_error") => ErrorKind::Auth,
        Some("not_found_error") => ErrorKind::NotFound,
        Some("rate_limit_error") => ErrorKind::RateLimit,
        Some("overloaded_error" | "api_error") => ErrorKind::Server,
        Some("invalid_request_error" | "request_too_large") if status < 500 => {
            ErrorKind::InvalidRequest
        }
        _ => classify_status(status),
    };
    let message = match error.r#type {
        Some(kind) => format!("{message} ({kind})"),
        None => message,
    };
    ApiError::new(kind, status, message, body)
}

/// Error for a response the safety filters refused to complete.
pub(crate) fn safety_error(detail: &str) -> ApiError {
    ApiError::new(
        ErrorKind::InvalidRequest,
        200,
        "response blocked by the provider's safety filters",
        detail,
    )
}
