use crate::types::Symbol;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated in `market-scanner`.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum ScannerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("failed to parse {field} for {symbol}: {value:?}")]
    Parse {
        symbol: Symbol,
        field: String,
        value: String,
    },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("circuit breaker open, level refresh suppressed")]
    CircuitOpen,
}

impl ScannerError {
    /// Construct a [`ScannerError::Parse`] for one field of one symbol.
    pub fn parse(symbol: impl Into<Symbol>, field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Parse {
            symbol: symbol.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    /// Determine if another attempt at the same upstream call may succeed.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_retryable(&self) -> bool {
        match self {
            ScannerError::Transport(_)
            | ScannerError::RateLimited(_)
            | ScannerError::UpstreamUnavailable(_) => true,
            _ => false,
        }
    }

    /// Determine if this failure counts towards opening the level-refresh circuit breaker.
    ///
    /// Malformed data for one symbol says nothing about upstream health.
    pub fn counts_against_breaker(&self) -> bool {
        self.is_retryable()
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ScannerError::RateLimited(_))
    }
}

impl From<reqwest::Error> for ScannerError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Self::RateLimited(error.to_string());
            }
            return Self::UpstreamUnavailable(format!("HTTP {status}: {error}"));
        }

        if error.is_timeout() || error.is_connect() || error.is_request() {
            Self::Transport(error.to_string())
        } else {
            Self::UpstreamUnavailable(error.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ScannerError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scanner_error_is_retryable() {
        struct TestCase {
            input: ScannerError,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: transport failures are retried
                input: ScannerError::Transport("connection reset".to_string()),
                expected: true,
            },
            TestCase {
                // TC1: 429s are retried
                input: ScannerError::RateLimited("HTTP 429".to_string()),
                expected: true,
            },
            TestCase {
                // TC2: 5xx are retried
                input: ScannerError::UpstreamUnavailable("HTTP 502".to_string()),
                expected: true,
            },
            TestCase {
                // TC3: malformed field for one symbol is not retried
                input: ScannerError::parse("BTC", "markPx", "abc"),
                expected: false,
            },
            TestCase {
                // TC4: an open breaker short-circuits without retry
                input: ScannerError::CircuitOpen,
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.is_retryable();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_parse_error_display() {
        let error = ScannerError::parse("ETH", "prevDayPx", "");
        assert_eq!(error.to_string(), "failed to parse prevDayPx for ETH: \"\"");
        assert!(!error.counts_against_breaker());
        assert!(ScannerError::RateLimited("slow down".to_string()).is_rate_limit());
    }
}
