//! Per-provider rate-limit header parsers.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::config::ProviderType;
use crate::error::LLMError;
use crate::http::header_value;
use crate::provider::retry::{retry_after_from_headers, wait_from_secs};

use super::RateLimitInfo;

/// Turns response headers into a [`RateLimitInfo`].
pub trait RateLimitParser: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the provider publishes no rate-limit headers at all, or
    /// none were present on this response.
    fn parse(&self, headers: &HashMap<String, String>, model: &str) -> Result<RateLimitInfo, LLMError>;
}

/// Picks the parser for a provider family.
pub fn parser_for(provider: ProviderType) -> Box<dyn RateLimitParser> {
    match provider {
        ProviderType::OpenAi | ProviderType::OpenAiCompatible => Box::new(OpenAiHeaderParser {
            provider,
            capture_extras: false,
        }),
        ProviderType::OpenRouter | ProviderType::Qwen => Box::new(OpenAiHeaderParser {
            provider,
            capture_extras: true,
        }),
        ProviderType::Anthropic => Box::new(AnthropicHeaderParser),
        ProviderType::Cerebras => Box::new(CerebrasHeaderParser),
        ProviderType::Gemini => Box::new(GeminiHeaderParser),
    }
}

/// Parses reset values: Go-style durations (`1s`, `1m30s`, `250ms`) or bare seconds.
///
/// Negative, non-finite and implausibly long values (over a day) yield `None`.
pub fn parse_reset_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(seconds) = value.parse::<f64>() {
        return wait_from_secs(seconds);
    }

    let mut total = 0.0_f64;
    let mut rest = value;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let amount: f64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let factor = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 0.001,
            "us" | "µs" => 0.000_001,
            "ns" => 0.000_000_001,
            _ => return None,
        };
        total += amount * factor;
        rest = &rest[unit_len..];
    }
    wait_from_secs(total)
}

fn number(headers: &HashMap<String, String>, name: &str) -> Option<u64> {
    let raw = header_value(headers, name)?.trim();
    raw.parse::<u64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().filter(|v| *v >= 0.0).map(|v| v as u64))
}

fn reset_in(headers: &HashMap<String, String>, name: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let wait = parse_reset_duration(header_value(headers, name)?)?;
    ChronoDuration::from_std(wait).ok().map(|wait| now + wait)
}

fn reset_at_rfc3339(headers: &HashMap<String, String>, name: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(header_value(headers, name)?.trim())
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

fn missing(provider: &'static str) -> LLMError {
    LLMError::provider(provider, "response carried no rate-limit headers")
}

/// `x-ratelimit-{limit,remaining,reset}-{requests,tokens}`, shared by OpenAI-shaped APIs.
pub struct OpenAiHeaderParser {
    provider: ProviderType,
    /// Keep unrecognised `x-ratelimit-*` headers in `custom_data`.
    capture_extras: bool,
}

const OPENAI_HEADERS: [&str; 6] = [
    "x-ratelimit-limit-requests",
    "x-ratelimit-remaining-requests",
    "x-ratelimit-reset-requests",
    "x-ratelimit-limit-tokens",
    "x-ratelimit-remaining-tokens",
    "x-ratelimit-reset-tokens",
];

impl RateLimitParser for OpenAiHeaderParser {
    fn parse(&self, headers: &HashMap<String, String>, model: &str) -> Result<RateLimitInfo, LLMError> {
        let now = Utc::now();
        let mut info = RateLimitInfo::new(self.provider.as_str(), model);
        info.requests_limit = number(headers, "x-ratelimit-limit-requests");
        info.requests_remaining = number(headers, "x-ratelimit-remaining-requests");
        info.requests_reset_at = reset_in(headers, "x-ratelimit-reset-requests", now);
        info.tokens_limit = number(headers, "x-ratelimit-limit-tokens");
        info.tokens_remaining = number(headers, "x-ratelimit-remaining-tokens");
        info.tokens_reset_at = reset_in(headers, "x-ratelimit-reset-tokens", now);
        info.retry_after = retry_after_from_headers(headers);

        if self.capture_extras {
            for (name, value) in headers {
                let lowered = name.to_ascii_lowercase();
                if lowered.starts_with("x-ratelimit-") && !OPENAI_HEADERS.contains(&lowered.as_str()) {
                    info.custom_data.insert(lowered, value.clone());
                }
            }
        }

        if info.is_blank() {
            return Err(missing(self.provider.as_str()));
        }
        Ok(info.normalized())
    }
}

/// `anthropic-ratelimit-*` with RFC 3339 reset timestamps.
pub struct AnthropicHeaderParser;

impl RateLimitParser for AnthropicHeaderParser {
    fn parse(&self, headers: &HashMap<String, String>, model: &str) -> Result<RateLimitInfo, LLMError> {
        let mut info = RateLimitInfo::new("anthropic", model);
        info.requests_limit = number(headers, "anthropic-ratelimit-requests-limit");
        info.requests_remaining = number(headers, "anthropic-ratelimit-requests-remaining");
        info.requests_reset_at = reset_at_rfc3339(headers, "anthropic-ratelimit-requests-reset");
        info.tokens_limit = number(headers, "anthropic-ratelimit-tokens-limit");
        info.tokens_remaining = number(headers, "anthropic-ratelimit-tokens-remaining");
        info.tokens_reset_at = reset_at_rfc3339(headers, "anthropic-ratelimit-tokens-reset");
        info.input_tokens_limit = number(headers, "anthropic-ratelimit-input-tokens-limit");
        info.input_tokens_remaining = number(headers, "anthropic-ratelimit-input-tokens-remaining");
        info.input_tokens_reset_at = reset_at_rfc3339(headers, "anthropic-ratelimit-input-tokens-reset");
        info.output_tokens_limit = number(headers, "anthropic-ratelimit-output-tokens-limit");
        info.output_tokens_remaining = number(headers, "anthropic-ratelimit-output-tokens-remaining");
        info.output_tokens_reset_at = reset_at_rfc3339(headers, "anthropic-ratelimit-output-tokens-reset");
        info.retry_after = retry_after_from_headers(headers);

        if info.is_blank() {
            return Err(missing("anthropic"));
        }
        Ok(info.normalized())
    }
}

/// Cerebras publishes a daily request window and a per-minute token window.
pub struct CerebrasHeaderParser;

impl RateLimitParser for CerebrasHeaderParser {
    fn parse(&self, headers: &HashMap<String, String>, model: &str) -> Result<RateLimitInfo, LLMError> {
        let now = Utc::now();
        let mut info = RateLimitInfo::new("cerebras", model);
        info.requests_limit = number(headers, "x-ratelimit-limit-requests-day");
        info.requests_remaining = number(headers, "x-ratelimit-remaining-requests-day");
        info.requests_reset_at = reset_in(headers, "x-ratelimit-reset-requests-day", now);
        info.daily_requests_remaining = info.requests_remaining;
        info.daily_requests_reset_at = info.requests_reset_at;
        info.tokens_limit = number(headers, "x-ratelimit-limit-tokens-minute");
        info.tokens_remaining = number(headers, "x-ratelimit-remaining-tokens-minute");
        info.tokens_reset_at = reset_in(headers, "x-ratelimit-reset-tokens-minute", now);
        info.retry_after = retry_after_from_headers(headers);

        if info.is_blank() {
            return Err(missing("cerebras"));
        }
        Ok(info.normalized())
    }
}

/// Gemini publishes no quota headers; throttling is only visible through 429s.
pub struct GeminiHeaderParser;

impl RateLimitParser for GeminiHeaderParser {
    fn parse(&self, _headers: &HashMap<String, String>, _model: &str) -> Result<RateLimitInfo, LLMError> {
        Err(LLMError::UnsupportedFeature {
            feature: "gemini rate-limit headers",
        })
    }
}
