//! Retry classification and backoff for transfers.

use std::time::Duration;

use crate::config::DownloadConfig;

/// Classification of a transfer error for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect or read timed out.
    Timeout,
    /// Server asked us to slow down (429, 503).
    Throttled,
    /// Connection reset, DNS failure and the like.
    Connection,
    /// Retryable server error.
    Http5xx(u16),
    /// The body ended before the announced size.
    ShortRead,
    /// Anything else; never retried.
    Permanent,
}

impl ErrorKind {
    pub fn is_transient(&self) -> bool {
        !matches!(self, ErrorKind::Permanent)
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Throttled => "throttled",
            ErrorKind::Connection => "connection",
            ErrorKind::Http5xx(_) => "http_5xx",
            ErrorKind::ShortRead => "short_read",
            ErrorKind::Permanent => "permanent",
        }
    }
}

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Give up; the download fails.
    NoRetry,
    /// Retry after the given delay.
    RetryAfter(Duration),
}

/// Exponential backoff bounded by a number of consecutive failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Consecutive failures that make a download fail.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Decide what to do after the `failures`-th consecutive failure
    /// (1-based) of kind `kind`.
    pub fn decide(&self, failures: u32, kind: ErrorKind) -> RetryDecision {
        if !kind.is_transient() || failures >= self.max_retries {
            return RetryDecision::NoRetry;
        }

        // base * 2^(failures-1), capped
        let factor = 1u32 << failures.saturating_sub(1).min(8);
        let mut delay = self.base_delay.saturating_mul(factor);
        if kind == ErrorKind::Throttled {
            delay = delay.saturating_mul(2);
        }
        RetryDecision::RetryAfter(delay.min(self.max_delay))
    }
}

/// Classify an HTTP status code.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        408 => ErrorKind::Timeout,
        429 | 503 => ErrorKind::Throttled,
        500..=599 => ErrorKind::Http5xx(status),
        _ => ErrorKind::Permanent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_permanent_errors_are_not_retried() {
        assert_eq!(policy(5).decide(1, ErrorKind::Permanent), RetryDecision::NoRetry);
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let p = policy(50);
        assert_eq!(
            p.decide(1, ErrorKind::Connection),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(
            p.decide(2, ErrorKind::Connection),
            RetryDecision::RetryAfter(Duration::from_millis(200))
        );
        assert_eq!(
            p.decide(30, ErrorKind::Timeout),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_throttling_waits_longer() {
        let p = policy(5);
        assert_eq!(
            p.decide(1, ErrorKind::Throttled),
            RetryDecision::RetryAfter(Duration::from_millis(200))
        );
    }

    #[test]
    fn test_gives_up_at_max_retries() {
        let p = policy(3);
        assert!(matches!(p.decide(1, ErrorKind::ShortRead), RetryDecision::RetryAfter(_)));
        assert!(matches!(p.decide(2, ErrorKind::ShortRead), RetryDecision::RetryAfter(_)));
        assert_eq!(p.decide(3, ErrorKind::ShortRead), RetryDecision::NoRetry);
    }

    #[test]
    fn test_zero_retries_fails_immediately() {
        assert_eq!(policy(0).decide(1, ErrorKind::Timeout), RetryDecision::NoRetry);
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(429), ErrorKind::Throttled);
        assert_eq!(classify_status(503), ErrorKind::Throttled);
        assert_eq!(classify_status(502), ErrorKind::Http5xx(502));
        assert_eq!(classify_status(408), ErrorKind::Timeout);
        assert_eq!(classify_status(404), ErrorKind::Permanent);
        assert_eq!(classify_status(401), ErrorKind::Permanent);
    }
}
