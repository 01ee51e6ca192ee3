use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::LLMError;

/// Requests per minute granted to Gemini's free tier.
pub const FREE_TIER_RPM: u32 = 15;
/// Requests per minute granted to Gemini's paid tier.
pub const PAID_TIER_RPM: u32 = 360;

struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_to_acquire(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
        }
    }
}

/// Client-side request pacing for backends that publish no quota headers.
pub struct ClientRateLimiter {
    requests_per_minute: u32,
    bucket: Mutex<TokenBucket>,
}

impl ClientRateLimiter {
    /// A limiter allowing `requests_per_minute`, with a full minute's burst available.
    pub fn new(requests_per_minute: u32) -> Self {
        let rpm = requests_per_minute.max(1);
        Self {
            requests_per_minute: rpm,
            bucket: Mutex::new(TokenBucket::new(f64::from(rpm), f64::from(rpm) / 60.0)),
        }
    }

    /// Limiter for a named tier: `paid` is 360 rpm, anything else the free 15 rpm.
    pub fn for_tier(tier: &str) -> Self {
        match tier.trim().to_ascii_lowercase().as_str() {
            "paid" | "tier1" | "tier-1" => Self::new(PAID_TIER_RPM),
            _ => Self::new(FREE_TIER_RPM),
        }
    }

    pub fn requests_per_minute(&self) -> u32 {
        self.requests_per_minute
    }

    /// Takes a permit without waiting.
    pub async fn try_acquire(&self) -> bool {
        self.bucket.lock().await.try_acquire()
    }

    /// Waits for a permit.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::Aborted`] when `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), LLMError> {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                if bucket.try_acquire() {
                    return Ok(());
                }
                bucket.time_to_acquire()
            };
            debug!(rpm = self.requests_per_minute, wait_ms = wait.as_millis() as u64, "client rate limiter waiting");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LLMError::aborted("cancelled while waiting for client rate limiter")),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

impl std::fmt::Debug for ClientRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRateLimiter")
            .field("requests_per_minute", &self.requests_per_minute)
            .finish_non_exhaustive()
    }
}
