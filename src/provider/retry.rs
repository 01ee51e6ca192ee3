use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::http::header_value;

/// Longest provider-requested wait taken at face value.
pub(crate) const MAX_PROVIDER_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Header seconds as a [`Duration`]. Negative, non-finite and out-of-range values
/// (above [`MAX_PROVIDER_WAIT`]) count as absent.
pub(crate) fn wait_from_secs(seconds: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(seconds)
        .ok()
        .filter(|wait| *wait <= MAX_PROVIDER_WAIT)
}

/// Extracts the wait a provider asked for after a throttled response.
///
/// `retry-after-ms` wins when present. `Retry-After` may be a number of seconds
/// (fractions allowed) or an HTTP-date. Values that are not a usable wait are ignored.
pub(crate) fn retry_after_from_headers(headers: &HashMap<String, String>) -> Option<Duration> {
    if let Some(wait) = header_value(headers, "retry-after-ms")
        .and_then(|value| value.trim().parse::<f64>().ok())
        .and_then(|millis| wait_from_secs(millis / 1000.0))
    {
        return Some(wait);
    }

    let value = header_value(headers, "retry-after")?.trim();
    if let Ok(seconds) = value.parse::<f64>() {
        return wait_from_secs(seconds);
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - Utc::now()).to_std().unwrap_or(Duration::ZERO)).filter(|wait| *wait <= MAX_PROVIDER_WAIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_seconds_case_insensitively() {
        assert_eq!(
            retry_after_from_headers(&headers(&[("Retry-After", "2")])),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            retry_after_from_headers(&headers(&[("retry-after", "0.5")])),
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn millisecond_header_takes_precedence() {
        let wait = retry_after_from_headers(&headers(&[("retry-after", "9"), ("retry-after-ms", "1500")]));
        assert_eq!(wait, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn http_date_in_the_past_is_zero() {
        let wait = retry_after_from_headers(&headers(&[("retry-after", "Wed, 21 Oct 2015 07:28:00 GMT")]));
        assert_eq!(wait, Some(Duration::ZERO));
    }

    #[test]
    fn garbage_is_ignored() {
        assert_eq!(retry_after_from_headers(&headers(&[("retry-after", "soon")])), None);
        assert_eq!(retry_after_from_headers(&HashMap::new()), None);
    }

    #[test]
    fn unusable_seconds_are_ignored() {
        for value in ["1e20", "-5", "NaN", "inf", "86401"] {
            assert_eq!(
                retry_after_from_headers(&headers(&[("retry-after", value)])),
                None,
                "retry-after: {value}"
            );
        }
        assert_eq!(
            retry_after_from_headers(&headers(&[("retry-after", "86400")])),
            Some(MAX_PROVIDER_WAIT)
        );
    }

    #[test]
    fn unusable_milliseconds_fall_back_to_seconds() {
        let wait = retry_after_from_headers(&headers(&[("retry-after-ms", "1e30"), ("retry-after", "4")]));
        assert_eq!(wait, Some(Duration::from_secs(4)));
        let wait = retry_after_from_headers(&headers(&[("retry-after-ms", "-1")]));
        assert_eq!(wait, None);
    }

    #[test]
    fn far_future_http_date_is_ignored() {
        let wait = retry_after_from_headers(&headers(&[("retry-after", "Fri, 01 Jan 9999 00:00:00 GMT")]));
        assert_eq!(wait, None);
    }
}
