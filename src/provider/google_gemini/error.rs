use serde::Deserialize;

use crate::error::{ApiError, ErrorKind, classify_status};

/// Parses error responses returned by Google Gemini.
///
/// Google RPC statuses (`UNAUTHENTICATED`, `RESOURCE_EXHAUSTED`, ...) refine the HTTP
/// status when they are present.
pub(crate) fn parse_gemini_error(status: u16, body: &str) -> ApiError {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<InnerError>,
    }

    #[derive(Deserialize)]
    struct InnerError {
        message: Option<String>,
        status: Option<String>,
    }

    // CloudCode sometimes answers with a one-element array around the error object.
    let parsed = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .or_else(|| {
            serde_json::from_str::<Vec<ErrorBody>>(body)
                .ok()
                .and_then(|list| list.into_iter().next())
        })
        .and_then(|parsed| parsed.error);
    let Some(error) = parsed else {
        return ApiError::from_status(status, format!("status {status}: {}", body.trim()), body);
    };

    // A bad key comes back as 400 INVALID_ARGUMENT with an API_KEY_INVALID reason.
    let key_rejected = body.contains("API_KEY_INVALID");
    let mut message = error.message.unwrap_or_else(|| "unknown error".to_string());
    let rpc_status = error.status.unwrap_or_default();
    if !rpc_status.is_empty() {
        message = format!("{message} ({rpc_status})");
    }
    let kind = match rpc_status.as_str() {
        _ if key_rejected => ErrorKind::Auth,
        "UNAUTHENTICATED" | "PERMISSION_DENIED" => ErrorKind::Auth,
        "RESOURCE_EXHAUSTED" => ErrorKind::RateLimit,
        "NOT_FOUND" => ErrorKind::NotFound,
        "INVALID_ARGUMENT" | "FAILED_PRECONDITION" if status < 500 => ErrorKind::InvalidRequest,
        "UNAVAILABLE" | "INTERNAL" | "DEADLINE_EXCEEDED" => ErrorKind::Server,
        _ => classify_status(status),
    };
    ApiError::new(kind, status, message, body)
}

/// Error for a candidate or prompt stopped by the safety filters.
pub(crate) fn safety_error(reason: &str) -> ApiError {
    ApiError::new(
        ErrorKind::InvalidRequest,
        200,
        format!("response blocked by safety filters ({reason})"),
        reason,
    )
}
