//! Typed error taxonomy for vendor operations.
//!
//! Every failure a vendor can produce maps onto one of these kinds; the
//! router and the health monitor never look at anything else.

use thiserror::Error;

/// Classification of a vendor-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    BadCredentials,
    NoStock,
    NoBalance,
    RateLimited,
    ServerError,
    Timeout,
    BadRequest,
    /// Activation finished in a non-SMS state. Not a failure: counted as a
    /// success for health, but surfaced to the caller as an error.
    LifecycleTerminal,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorKind::BadCredentials => "BAD_CREDENTIALS",
            ErrorKind::NoStock => "NO_STOCK",
            ErrorKind::NoBalance => "NO_BALANCE",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::ServerError => "SERVER_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::BadRequest => "BAD_REQUEST",
            ErrorKind::LifecycleTerminal => "LIFECYCLE_TERMINAL",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// Whether the router should move on to the next vendor.
    ///
    /// `NO_BALANCE` is retryable on purpose: the next vendor may well have
    /// funds even though this one is broke.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NoStock
                | ErrorKind::NoBalance
                | ErrorKind::RateLimited
                | ErrorKind::ServerError
                | ErrorKind::Timeout
                | ErrorKind::Unknown
        )
    }

    /// Kinds that indicate vendor-wide failure and trip the circuit at once.
    pub fn is_systemic(&self) -> bool {
        matches!(self, ErrorKind::BadCredentials)
    }

    /// Counted as a success when recording health samples.
    pub fn is_health_success(&self) -> bool {
        matches!(self, ErrorKind::LifecycleTerminal)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure from one vendor operation.
#[derive(Debug, Clone, Error)]
#[error("[{vendor}] {kind}: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub vendor: String,
    pub message: String,
    pub http_status: Option<u16>,
    /// Suggested wait before retrying, from the mapping's backoff hint.
    pub backoff_ms: Option<u64>,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, vendor: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            vendor: vendor.into(),
            message: message.into(),
            http_status: None,
            backoff_ms: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_backoff(mut self, backoff_ms: Option<u64>) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }

    pub fn bad_request(vendor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, vendor, message)
    }

    pub fn timeout(vendor: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, vendor, "request timed out")
    }

    /// Fallback classification by HTTP status when no mapping rule matched.
    pub fn from_status(vendor: impl Into<String>, status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => ErrorKind::BadCredentials,
            429 => ErrorKind::RateLimited,
            400 | 404 | 422 => ErrorKind::BadRequest,
            s if s >= 500 => ErrorKind::ServerError,
            _ => ErrorKind::Unknown,
        };
        let snippet: String = body.chars().take(200).collect();
        Self::new(kind, vendor, snippet).with_status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_set_matches_routing_policy() {
        assert!(ErrorKind::NoStock.is_retryable());
        assert!(ErrorKind::NoBalance.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::ServerError.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::BadCredentials.is_retryable());
        assert!(!ErrorKind::BadRequest.is_retryable());
        assert!(!ErrorKind::LifecycleTerminal.is_retryable());
    }

    #[test]
    fn only_bad_credentials_is_systemic() {
        assert!(ErrorKind::BadCredentials.is_systemic());
        assert!(!ErrorKind::ServerError.is_systemic());
        assert!(!ErrorKind::Unknown.is_systemic());
    }

    #[test]
    fn status_fallback_classification() {
        assert_eq!(
            ProviderError::from_status("v", 401, "").kind,
            ErrorKind::BadCredentials
        );
        assert_eq!(
            ProviderError::from_status("v", 429, "").kind,
            ErrorKind::RateLimited
        );
        assert_eq!(
            ProviderError::from_status("v", 503, "").kind,
            ErrorKind::ServerError
        );
        assert_eq!(
            ProviderError::from_status("v", 404, "").kind,
            ErrorKind::BadRequest
        );
    }
}
