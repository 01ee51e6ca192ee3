use serde::Deserialize;
use serde_json::Value;

use crate::error::{ApiError, ErrorKind, classify_status};

/// Parses error responses returned by OpenAI-compatible Chat Completions endpoints.
///
/// The status decides the kind unless the body names a well-known error `code` or
/// `type`, which then wins and gets a readable message.
pub(crate) fn parse_openai_error(status: u16, body: &str) -> ApiError {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<InnerError>,
    }
    #[derive(Deserialize)]
    struct InnerError {
        message: Option<String>,
        r#type: Option<String>,
        code: Option<Value>,
    }

    let Some(error) = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.error)
    else {
        return ApiError::from_status(status, format!("status {status}: {}", body.trim()), body);
    };

    let detail = error.message.unwrap_or_else(|| "unknown error".to_string());
    let code = error.code.as_ref().and_then(Value::as_str).map(str::to_string);
    let markers = [code.as_deref(), error.r#type.as_deref()];
    let has = |needle: &str| markers.iter().flatten().any(|marker| *marker == needle);

    let (kind, message, retryable) = if has("invalid_api_key") {
        (ErrorKind::Auth, format!("invalid API key: {detail}"), None)
    } else if has("insufficient_quota") {
        (
            ErrorKind::RateLimit,
            format!("quota exhausted, check the plan and billing details: {detail}"),
            Some(false),
        )
    } else if has("rate_limit_exceeded") {
        (ErrorKind::RateLimit, format!("rate limit exceeded: {detail}"), None)
    } else if has("model_not_found") {
        (ErrorKind::NotFound, format!("model not found: {detail}"), None)
    } else if has("invalid_request_error") && status < 500 && classify_status(status) != ErrorKind::Auth {
        (ErrorKind::InvalidRequest, format!("invalid request: {detail}"), None)
    } else {
        (classify_status(status), detail, None)
    };

    let error = ApiError::new(kind, status, message, body);
    match retryable {
        Some(retryable) => error.with_retryable(retryable),
        None => error,
    }
}
