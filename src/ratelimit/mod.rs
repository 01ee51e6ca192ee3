//! Server-reported quota tracking and client-side request pacing.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::ProviderType;
use crate::error::{ApiError, ErrorKind, LLMError};
use crate::provider::retry::MAX_PROVIDER_WAIT;

pub mod bucket;
pub mod headers;

pub use bucket::ClientRateLimiter;
pub use headers::{RateLimitParser, parse_reset_duration, parser_for};

/// Longest a request is held back by [`RateLimitTracker::check_rate_limit_and_wait`].
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10);

/// Uniform view of one (provider, model) quota as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RateLimitInfo {
    pub provider: String,
    pub model: String,
    pub requests_limit: Option<u64>,
    pub requests_remaining: Option<u64>,
    pub requests_reset_at: Option<DateTime<Utc>>,
    pub tokens_limit: Option<u64>,
    pub tokens_remaining: Option<u64>,
    pub tokens_reset_at: Option<DateTime<Utc>>,
    pub input_tokens_limit: Option<u64>,
    pub input_tokens_remaining: Option<u64>,
    pub input_tokens_reset_at: Option<DateTime<Utc>>,
    pub output_tokens_limit: Option<u64>,
    pub output_tokens_remaining: Option<u64>,
    pub output_tokens_reset_at: Option<DateTime<Utc>>,
    pub daily_requests_remaining: Option<u64>,
    pub daily_requests_reset_at: Option<DateTime<Utc>>,
    pub retry_after: Option<Duration>,
    pub custom_data: HashMap<String, String>,
}

impl RateLimitInfo {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            ..Self::default()
        }
    }

    /// True when no quota field was populated.
    pub fn is_blank(&self) -> bool {
        self.requests_limit.is_none()
            && self.requests_remaining.is_none()
            && self.tokens_limit.is_none()
            && self.tokens_remaining.is_none()
            && self.input_tokens_remaining.is_none()
            && self.output_tokens_remaining.is_none()
            && self.daily_requests_remaining.is_none()
            && self.retry_after.is_none()
            && self.custom_data.is_empty()
    }

    /// Clamps every `remaining` to its `limit`.
    pub fn normalized(mut self) -> Self {
        fn clamp(remaining: &mut Option<u64>, limit: Option<u64>) {
            if let (Some(value), Some(limit)) = (remaining.as_mut(), limit) {
                *value = (*value).min(limit);
            }
        }
        clamp(&mut self.requests_remaining, self.requests_limit);
        clamp(&mut self.tokens_remaining, self.tokens_limit);
        clamp(&mut self.input_tokens_remaining, self.input_tokens_limit);
        clamp(&mut self.output_tokens_remaining, self.output_tokens_limit);
        self
    }

    /// Remaining value of a window, treating a passed reset as replenished.
    fn live_remaining(remaining: Option<u64>, reset_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<u64> {
        match reset_at {
            Some(reset) if reset <= now => None,
            _ => remaining,
        }
    }
}

fn later(old: Option<DateTime<Utc>>, new: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (old, new) {
        (Some(old), Some(new)) => Some(old.max(new)),
        (old, new) => new.or(old),
    }
}

#[derive(Debug, Default)]
struct ModelState {
    info: Option<RateLimitInfo>,
    retry_until: Option<Instant>,
}

/// Per-model rate-limit state for one provider instance.
pub struct RateLimitTracker {
    provider: ProviderType,
    parser: Box<dyn RateLimitParser>,
    max_wait: Duration,
    state: RwLock<HashMap<String, ModelState>>,
}

impl RateLimitTracker {
    pub fn new(provider: ProviderType) -> Self {
        Self {
            provider,
            parser: parser_for(provider),
            max_wait: DEFAULT_MAX_WAIT,
            state: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Parses response headers and merges the result. Returns whether anything was recorded.
    pub async fn observe(&self, headers: &HashMap<String, String>, model: &str) -> bool {
        match self.parser.parse(headers, model) {
            Ok(info) => {
                self.update(info).await;
                true
            }
            Err(err) => {
                trace!(provider = %self.provider, model, error = %err, "no rate-limit info on response");
                false
            }
        }
    }

    /// Merges a new observation for `info.model`.
    ///
    /// Reset timestamps never move backwards and `remaining` never exceeds `limit`.
    pub async fn update(&self, info: RateLimitInfo) {
        let info = info.normalized();
        let mut state = self.state.write().await;
        let entry = state.entry(info.model.clone()).or_default();
        if let Some(wait) = info.retry_after {
            entry.retry_until = Some(Instant::now() + wait.min(MAX_PROVIDER_WAIT));
        }
        let merged = match entry.info.take() {
            Some(old) => RateLimitInfo {
                requests_reset_at: later(old.requests_reset_at, info.requests_reset_at),
                tokens_reset_at: later(old.tokens_reset_at, info.tokens_reset_at),
                input_tokens_reset_at: later(old.input_tokens_reset_at, info.input_tokens_reset_at),
                output_tokens_reset_at: later(old.output_tokens_reset_at, info.output_tokens_reset_at),
                daily_requests_reset_at: later(old.daily_requests_reset_at, info.daily_requests_reset_at),
                ..info
            },
            None => info,
        };
        entry.info = Some(merged);
    }

    /// Records a server-imposed back-off, e.g. from a 429.
    pub async fn record_retry_after(&self, model: &str, wait: Duration) {
        debug!(provider = %self.provider, model, wait_ms = wait.as_millis() as u64, "recording retry-after");
        let mut state = self.state.write().await;
        let entry = state.entry(model.to_string()).or_default();
        entry.retry_until = Some(Instant::now() + wait.min(MAX_PROVIDER_WAIT));
        let info = entry
            .info
            .get_or_insert_with(|| RateLimitInfo::new(self.provider.as_str(), model));
        info.retry_after = Some(wait);
    }

    /// Last observation for `model`.
    pub async fn get(&self, model: &str) -> Option<RateLimitInfo> {
        self.state.read().await.get(model).and_then(|entry| entry.info.clone())
    }

    /// Whether a request for `planned_tokens` fits the last known quota.
    pub async fn can_make_request(&self, model: &str, planned_tokens: u64) -> bool {
        let state = self.state.read().await;
        let Some(entry) = state.get(model) else {
            return true;
        };
        if entry.retry_until.is_some_and(|until| until > Instant::now()) {
            return false;
        }
        let Some(info) = &entry.info else {
            return true;
        };
        let now = Utc::now();
        let requests = RateLimitInfo::live_remaining(info.requests_remaining, info.requests_reset_at, now);
        let tokens = RateLimitInfo::live_remaining(info.tokens_remaining, info.tokens_reset_at, now);
        let daily = RateLimitInfo::live_remaining(info.daily_requests_remaining, info.daily_requests_reset_at, now);
        requests.is_none_or(|remaining| remaining > 0)
            && tokens.is_none_or(|remaining| remaining >= planned_tokens)
            && daily.is_none_or(|remaining| remaining > 0)
    }

    /// Time until every window blocking a `planned_tokens` request has reset.
    ///
    /// `None` when a blocking window has no known reset.
    async fn blocked_for(&self, model: &str, planned_tokens: u64) -> Option<Duration> {
        let state = self.state.read().await;
        let Some(entry) = state.get(model) else {
            return Some(Duration::ZERO);
        };
        let mut wait = entry
            .retry_until
            .map_or(Duration::ZERO, |until| until.saturating_duration_since(Instant::now()));
        let Some(info) = &entry.info else {
            return Some(wait);
        };

        let now = Utc::now();
        let windows = [
            (info.requests_remaining, info.requests_reset_at, 1),
            (info.tokens_remaining, info.tokens_reset_at, planned_tokens),
            (info.daily_requests_remaining, info.daily_requests_reset_at, 1),
        ];
        for (remaining, reset, needed) in windows {
            let live = RateLimitInfo::live_remaining(remaining, reset, now);
            if live.is_none_or(|remaining| remaining >= needed) {
                continue;
            }
            let until_reset = (reset? - now).to_std().unwrap_or(Duration::ZERO);
            wait = wait.max(until_reset);
        }
        Some(wait)
    }

    /// How long until `model` can be called again. Zero when nothing is known.
    pub async fn get_wait_time(&self, model: &str) -> Duration {
        let state = self.state.read().await;
        let Some(entry) = state.get(model) else {
            return Duration::ZERO;
        };

        if let Some(until) = entry.retry_until {
            let wait = until.saturating_duration_since(Instant::now());
            if !wait.is_zero() {
                return wait;
            }
        }

        let Some(info) = &entry.info else {
            return Duration::ZERO;
        };
        let now = Utc::now();
        let exhausted = [
            (info.requests_remaining, info.requests_reset_at),
            (info.tokens_remaining, info.tokens_reset_at),
            (info.input_tokens_remaining, info.input_tokens_reset_at),
            (info.output_tokens_remaining, info.output_tokens_reset_at),
            (info.daily_requests_remaining, info.daily_requests_reset_at),
        ];
        exhausted
            .iter()
            .filter(|(remaining, _)| *remaining == Some(0))
            .filter_map(|(_, reset)| *reset)
            .filter(|reset| *reset > now)
            .min()
            .and_then(|reset| (reset - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    /// Holds the caller until the quota allows the request, bounded by the max wait.
    ///
    /// Returns whether the request is allowed once the wait is over.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::Aborted`] when `cancel` fires during the wait, and a
    /// rate-limit [`LLMError::Api`] when an exhausted window has no known reset.
    pub async fn check_rate_limit_and_wait(
        &self,
        cancel: &CancellationToken,
        model: &str,
        planned_tokens: u64,
    ) -> Result<bool, LLMError> {
        if self.can_make_request(model, planned_tokens).await {
            return Ok(true);
        }
        let Some(wait) = self.blocked_for(model, planned_tokens).await else {
            debug!(provider = %self.provider, model, "quota exhausted with no known reset");
            return Err(ApiError::new(
                ErrorKind::RateLimit,
                429,
                format!("{model}: quota exhausted and the provider gave no reset time"),
                "",
            )
            .into());
        };
        let wait = wait.min(self.max_wait);
        debug!(provider = %self.provider, model, wait_ms = wait.as_millis() as u64, "waiting for rate limit");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LLMError::aborted("cancelled while waiting for rate limit")),
            _ = tokio::time::sleep(wait) => {}
        }
        Ok(self.can_make_request(model, planned_tokens).await)
    }

    /// True when any known window has `remaining / limit <= fraction`.
    pub async fn should_throttle(&self, model: &str, fraction: f64) -> bool {
        let Some(info) = self.get(model).await else {
            return false;
        };
        [
            (info.requests_remaining, info.requests_limit),
            (info.tokens_remaining, info.tokens_limit),
            (info.input_tokens_remaining, info.input_tokens_limit),
            (info.output_tokens_remaining, info.output_tokens_limit),
        ]
        .iter()
        .any(|window| match window {
            (Some(remaining), Some(limit)) if *limit > 0 => (*remaining as f64 / *limit as f64) <= fraction,
            _ => false,
        })
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("provider", &self.provider)
            .field("max_wait", &self.max_wait)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    fn info(model: &str) -> RateLimitInfo {
        RateLimitInfo::new("openai", model)
    }

    #[tokio::test]
    async fn unknown_model_is_allowed() {
        let tracker = RateLimitTracker::new(ProviderType::OpenAi);
        assert!(tracker.can_make_request("gpt-4o", 1000).await);
        assert_eq!(tracker.get_wait_time("gpt-4o").await, Duration::ZERO);
        assert!(tracker.get("gpt-4o").await.is_none());
    }

    #[tokio::test]
    async fn exhausted_requests_block_until_reset() {
        let tracker = RateLimitTracker::new(ProviderType::OpenAi);
        tracker
            .update(RateLimitInfo {
                requests_limit: Some(10),
                requests_remaining: Some(0),
                requests_reset_at: Some(Utc::now() + ChronoDuration::seconds(5)),
                ..info("m")
            })
            .await;
        assert!(!tracker.can_make_request("m", 0).await);
        let wait = tracker.get_wait_time("m").await;
        assert!(wait > Duration::from_secs(4) && wait <= Duration::from_secs(5), "{wait:?}");
    }

    #[tokio::test]
    async fn token_budget_is_checked() {
        let tracker = RateLimitTracker::new(ProviderType::OpenAi);
        tracker
            .update(RateLimitInfo {
                tokens_limit: Some(1000),
                tokens_remaining: Some(100),
                tokens_reset_at: Some(Utc::now() + ChronoDuration::seconds(30)),
                ..info("m")
            })
            .await;
        assert!(tracker.can_make_request("m", 100).await);
        assert!(!tracker.can_make_request("m", 101).await);
        assert!(tracker.should_throttle("m", 0.1).await);
        assert!(!tracker.should_throttle("m", 0.05).await);
    }

    #[tokio::test]
    async fn passed_reset_counts_as_replenished() {
        let tracker = RateLimitTracker::new(ProviderType::OpenAi);
        tracker
            .update(RateLimitInfo {
                requests_remaining: Some(0),
                requests_reset_at: Some(Utc::now() - ChronoDuration::seconds(1)),
                ..info("m")
            })
            .await;
        assert!(tracker.can_make_request("m", 0).await);
    }

    #[tokio::test]
    async fn retry_after_sets_exact_wait() {
        let tracker = RateLimitTracker::new(ProviderType::Gemini);
        tracker.record_retry_after("gemini-2.5-flash", Duration::from_secs(2)).await;
        let wait = tracker.get_wait_time("gemini-2.5-flash").await;
        assert!(
            wait <= Duration::from_secs(2) && wait >= Duration::from_millis(1950),
            "{wait:?}"
        );
        assert!(!tracker.can_make_request("gemini-2.5-flash", 0).await);
        assert_eq!(
            tracker.get("gemini-2.5-flash").await.unwrap().retry_after,
            Some(Duration::from_secs(2))
        );
    }

    #[tokio::test]
    async fn reset_timestamps_never_move_backwards() {
        let tracker = RateLimitTracker::new(ProviderType::Anthropic);
        let far = Utc::now() + ChronoDuration::seconds(60);
        let near = Utc::now() + ChronoDuration::seconds(10);
        tracker
            .update(RateLimitInfo {
                requests_remaining: Some(5),
                requests_reset_at: Some(far),
                ..info("m")
            })
            .await;
        tracker
            .update(RateLimitInfo {
                requests_remaining: Some(4),
                requests_reset_at: Some(near),
                ..info("m")
            })
            .await;
        let merged = tracker.get("m").await.unwrap();
        assert_eq!(merged.requests_reset_at, Some(far));
        assert_eq!(merged.requests_remaining, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_bounded_and_then_allows() {
        let tracker = RateLimitTracker::new(ProviderType::Gemini).with_max_wait(Duration::from_secs(10));
        tracker.record_retry_after("m", Duration::from_secs(3)).await;
        let started = Instant::now();
        let allowed = tracker
            .check_rate_limit_and_wait(&CancellationToken::new(), "m", 0)
            .await
            .unwrap();
        assert!(allowed);
        assert!(started.elapsed() >= Duration::from_secs(3));

        tracker.record_retry_after("m", Duration::from_secs(60)).await;
        let started = Instant::now();
        let allowed = tracker
            .check_rate_limit_and_wait(&CancellationToken::new(), "m", 0)
            .await
            .unwrap();
        assert!(!allowed);
        assert!(started.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test]
    async fn exhausted_daily_window_reports_its_reset() {
        let tracker = RateLimitTracker::new(ProviderType::Cerebras);
        tracker
            .update(RateLimitInfo {
                daily_requests_remaining: Some(0),
                daily_requests_reset_at: Some(Utc::now() + ChronoDuration::seconds(5)),
                ..info("m")
            })
            .await;
        assert!(!tracker.can_make_request("m", 0).await);
        let wait = tracker.get_wait_time("m").await;
        assert!(wait > Duration::from_secs(4) && wait <= Duration::from_secs(5), "{wait:?}");
    }

    #[tokio::test]
    async fn exhausted_window_without_reset_is_an_error() {
        let tracker = RateLimitTracker::new(ProviderType::Cerebras);
        tracker
            .update(RateLimitInfo {
                daily_requests_remaining: Some(0),
                ..info("m")
            })
            .await;
        match tracker.check_rate_limit_and_wait(&CancellationToken::new(), "m", 0).await {
            Err(err) => assert!(err.is_rate_limit(), "{err}"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_honours_cancellation() {
        let tracker = RateLimitTracker::new(ProviderType::Gemini);
        tracker.record_retry_after("m", Duration::from_secs(5)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        match tracker.check_rate_limit_and_wait(&cancel, "m", 0).await {
            Err(LLMError::Aborted { .. }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
