use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Coarse classification shared by every backend.
///
/// Credential pools only look at the kind of an error: `Auth` quarantines a credential,
/// everything else counts as an ordinary failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RateLimit,
    Auth,
    NotFound,
    InvalidRequest,
    Server,
    Unknown,
}

impl ErrorKind {
    /// Default retryability for the kind, before any provider override.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::RateLimit | ErrorKind::Server)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Server => "server",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps an HTTP status code onto an [`ErrorKind`].
///
/// # Examples
///
/// ```
/// use llm_relay::error::{ErrorKind, classify_status};
///
/// assert_eq!(classify_status(401), ErrorKind::Auth);
/// assert_eq!(classify_status(429), ErrorKind::RateLimit);
/// assert_eq!(classify_status(503), ErrorKind::Server);
/// assert_eq!(classify_status(418), ErrorKind::Unknown);
/// ```
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::Auth,
        404 => ErrorKind::NotFound,
        400 => ErrorKind::InvalidRequest,
        429 => ErrorKind::RateLimit,
        500..=599 => ErrorKind::Server,
        _ => ErrorKind::Unknown,
    }
}

/// A classified upstream failure.
///
/// Carries the raw response body so callers can inspect what the provider actually said.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
    pub body: String,
    /// Starts as `kind.is_retryable()`; provider classifiers may override it.
    pub retryable: bool,
    /// Wait suggested by the provider, usually from `Retry-After`.
    pub retry_after: Option<Duration>,
}

impl ApiError {
    /// Builds an error whose kind is derived from the status code.
    pub fn from_status(status: u16, message: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(classify_status(status), status, message, body)
    }

    pub fn new(
        kind: ErrorKind,
        status: u16,
        message: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
            body: body.into(),
            retryable: kind.is_retryable(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error (status {}): {}", self.kind, self.status, self.message)?;
        if let Some(wait) = self.retry_after {
            write!(f, "; retry after {:.3}s", wait.as_secs_f64())?;
        }
        Ok(())
    }
}

/// Aggregates every failure mode exposed by the client.
///
/// Callers can match on the variant to decide whether to retry, fall back to another
/// provider, or surface an actionable message to the user interface.
#[derive(Debug, Error)]
pub enum LLMError {
    /// Represents transport-layer or networking failures.
    #[error("transport error: {message}")]
    Transport { message: String },
    /// A non-2xx response that went through a provider classifier.
    #[error("{0}")]
    Api(ApiError),
    /// Signals validation failures in the request payload.
    #[error("invalid request: {message}")]
    Validation { message: String },
    /// Raised when building or validating configuration fails.
    #[error("invalid configuration for {field}: {reason}")]
    InvalidConfig {
        /// Name of the configuration field that failed validation.
        field: String,
        /// Additional context explaining why the field is invalid.
        reason: String,
    },
    /// No API key or OAuth credential is available for the provider.
    #[error("no credentials configured for {provider}")]
    NoCredentials { provider: String },
    /// Declares that a capability is not supported by the selected provider.
    #[error("feature unsupported: {feature}")]
    UnsupportedFeature { feature: &'static str },
    /// Surfaces cancellations triggered by the caller's token.
    #[error("request aborted: {message}")]
    Aborted { message: String },
    /// Signals that an SSE channel closed before delivering its terminal event.
    #[error("stream closed unexpectedly: {message}")]
    StreamClosed { message: String },
    /// Wraps provider-defined errors that cannot be normalized, mostly decode failures.
    #[error("provider {provider} error: {message}")]
    Provider {
        /// Name of the provider, such as `openai_chat`.
        provider: &'static str,
        message: String,
    },
    /// An OAuth refresh failed. `permanent` is set when the refresh token was rejected.
    #[error("token refresh failed for credential {credential}: {message}")]
    Refresh {
        credential: String,
        message: String,
        permanent: bool,
    },
    /// Several independent operations failed, e.g. a parallel refresh.
    #[error("{} operations failed: {}", errors.len(), join_errors(errors))]
    Aggregate { errors: Vec<LLMError> },
}

fn join_errors(errors: &[LLMError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl LLMError {
    /// Creates an [`LLMError::Transport`] from a textual description.
    ///
    /// # Examples
    ///
    /// ```
    /// use llm_relay::error::LLMError;
    ///
    /// let err = LLMError::transport("dns lookup failed");
    /// assert!(matches!(err, LLMError::Transport { .. }));
    /// ```
    pub fn transport<T: Into<String>>(message: T) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates an [`LLMError::Provider`] with the given provider name and message.
    ///
    /// # Examples
    ///
    /// ```
    /// use llm_relay::error::LLMError;
    ///
    /// let err = LLMError::provider("openai_chat", "bad JSON payload");
    /// assert!(matches!(err, LLMError::Provider { provider: "openai_chat", .. }));
    /// ```
    pub fn provider<T: Into<String>>(provider: &'static str, message: T) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
        }
    }

    pub fn validation<T: Into<String>>(message: T) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn aborted<T: Into<String>>(message: T) -> Self {
        Self::Aborted {
            message: message.into(),
        }
    }

    /// Projects the error onto the shared [`ErrorKind`] taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LLMError::Api(api) => api.kind,
            LLMError::Validation { .. } | LLMError::InvalidConfig { .. } => {
                ErrorKind::InvalidRequest
            }
            LLMError::NoCredentials { .. } => ErrorKind::Auth,
            LLMError::Refresh { permanent, .. } => {
                if *permanent {
                    ErrorKind::Auth
                } else {
                    ErrorKind::Unknown
                }
            }
            LLMError::Transport { .. }
            | LLMError::UnsupportedFeature { .. }
            | LLMError::Aborted { .. }
            | LLMError::StreamClosed { .. }
            | LLMError::Provider { .. }
            | LLMError::Aggregate { .. } => ErrorKind::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            LLMError::Api(api) => api.retryable,
            LLMError::Transport { .. } => true,
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LLMError::Api(api) => api.retry_after,
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        self.kind() == ErrorKind::Auth
    }

    pub fn is_rate_limit(&self) -> bool {
        self.kind() == ErrorKind::RateLimit
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, LLMError::Aborted { .. })
    }

    /// Whether another credential would get the same answer: the request itself was
    /// rejected, or the caller cancelled. Failover stops on these without blaming the
    /// credential.
    pub fn stops_failover(&self) -> bool {
        self.is_aborted() || matches!(self.kind(), ErrorKind::InvalidRequest | ErrorKind::NotFound)
    }
}

impl From<ApiError> for LLMError {
    fn from(value: ApiError) -> Self {
        LLMError::Api(value)
    }
}
