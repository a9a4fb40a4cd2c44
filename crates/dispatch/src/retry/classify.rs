//! Error classification for provider calls
//!
//! Status codes are matched against the retry config's allowlist; failures
//! without a status fall back to matching well-known network error substrings.

use std::fmt;
use std::time::Duration;

use crate::error::DispatchError;

/// Substrings that identify transient network failures in error messages
pub const NETWORK_ERROR_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "connection closed",
    "broken pipe",
    "context deadline exceeded",
    "temporary failure",
    "no such host",
    "network is unreachable",
    "eof",
];

/// Trait for errors that can be classified as retryable or non-retryable
pub trait RetryableError: fmt::Debug + Send + Sync + 'static {
    /// Whether the error itself claims to be transient
    fn is_retryable(&self) -> bool;

    /// Short machine-friendly category used in logs
    fn error_type(&self) -> String;

    fn error_message(&self) -> String;

    /// HTTP-like status code, when the failure came from a response
    fn status_code(&self) -> Option<u16> {
        None
    }

    /// Rate-limit "retry after" hint extracted from the response
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Returns true if the message looks like a transient network failure
pub fn is_network_error_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    NETWORK_ERROR_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// Classified failure of an outbound provider call
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderError {
    pub error_type: String,
    pub message: String,
    pub status_code: Option<u16>,
    pub retry_after: Option<Duration>,
    pub is_retryable: bool,
}

impl ProviderError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>, is_retryable: bool) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            status_code: None,
            retry_after: None,
            is_retryable,
        }
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Create error from HTTP status code
    pub fn from_status_code(status_code: u16, message: impl Into<String>) -> Self {
        let (error_type, is_retryable) = match status_code {
            429 => ("rate_limit", true),
            500..=599 => ("server_error", true),
            408 => ("timeout", true),
            400 => ("bad_request", false),
            401 => ("unauthorized", false),
            403 => ("forbidden", false),
            404 => ("not_found", false),
            422 => ("validation", false),
            _ => ("unknown", false),
        };

        Self {
            error_type: error_type.to_string(),
            message: message.into(),
            status_code: Some(status_code),
            retry_after: None,
            is_retryable,
        }
    }

    /// Create error from a status code and the response headers.
    ///
    /// Header names are matched case-insensitively.
    pub fn from_response<'a, I>(status_code: u16, message: impl Into<String>, headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut error = Self::from_status_code(status_code, message);
        error.retry_after = parse_retry_after(headers);
        error
    }

    /// Create error from a free-form transport message
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_network_error_message(&message) {
            let error_type = if message.to_lowercase().contains("timeout")
                || message.to_lowercase().contains("timed out")
                || message.to_lowercase().contains("deadline")
            {
                "timeout"
            } else {
                "network"
            };
            Self::new(error_type, message, true)
        } else {
            Self::new("request", message, false)
        }
    }

    #[cfg(feature = "live-discovery")]
    pub fn from_reqwest_error(error: reqwest::Error) -> Self {
        let is_retryable = error.is_timeout() || error.is_connect();
        let error_type = if error.is_timeout() {
            "timeout"
        } else if error.is_connect() {
            "network"
        } else {
            "request"
        };
        let mut classified = Self::new(error_type, error.to_string(), is_retryable);
        if let Some(status) = error.status() {
            classified = Self::from_status_code(status.as_u16(), error.to_string());
        }
        classified
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} ({}): {}", self.error_type, code, self.message),
            None => write!(f, "{}: {}", self.error_type, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

impl RetryableError for ProviderError {
    fn is_retryable(&self) -> bool {
        self.is_retryable
    }

    fn error_type(&self) -> String {
        self.error_type.clone()
    }

    fn error_message(&self) -> String {
        self.message.clone()
    }

    fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Lets health-checked operations that already speak `DispatchError` run
/// through the retry engine.
impl RetryableError for DispatchError {
    fn is_retryable(&self) -> bool {
        matches!(self.root(), DispatchError::RetryableTransport { .. })
    }

    fn error_type(&self) -> String {
        match self.root() {
            DispatchError::RetryableTransport { error_type, .. }
            | DispatchError::NonRetryable { error_type, .. } => error_type.clone(),
            DispatchError::NotFound(_) => "not_found".to_string(),
            DispatchError::NoCandidates => "no_candidates".to_string(),
            DispatchError::CircuitOpen { .. } => "circuit_open".to_string(),
            DispatchError::CallbackAbort { .. } => "callback_abort".to_string(),
            DispatchError::Cancelled { .. } => "cancelled".to_string(),
            DispatchError::Config(_) => "config".to_string(),
            DispatchError::AttemptsFailed { .. } => "attempts_failed".to_string(),
        }
    }

    fn error_message(&self) -> String {
        match self.root() {
            DispatchError::RetryableTransport { message, .. }
            | DispatchError::NonRetryable { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    fn status_code(&self) -> Option<u16> {
        DispatchError::status_code(self)
    }
}

/// Convert a classified failure into the public taxonomy
pub(crate) fn to_dispatch_error<E: RetryableError>(error: &E, retryable: bool) -> DispatchError {
    if retryable {
        DispatchError::RetryableTransport {
            error_type: error.error_type(),
            message: error.error_message(),
            status_code: error.status_code(),
        }
    } else {
        DispatchError::NonRetryable {
            error_type: error.error_type(),
            message: error.error_message(),
            status_code: error.status_code(),
        }
    }
}

/// Extract a retry-after hint from rate-limit headers.
///
/// Understands `Retry-After` in seconds and the `x-ratelimit-reset-*` family
/// with `"1.5s"`, `"250ms"` or `"1m30s"` values. The largest hint wins.
pub fn parse_retry_after<'a, I>(headers: I) -> Option<Duration>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut hint: Option<Duration> = None;
    for (name, value) in headers {
        let name = name.to_ascii_lowercase();
        let parsed = if name == "retry-after" {
            value
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64)
        } else if name.starts_with("x-ratelimit-reset") {
            parse_reset_duration(value.trim())
        } else {
            None
        };

        if let Some(parsed) = parsed {
            hint = Some(hint.map_or(parsed, |current| current.max(parsed)));
        }
    }
    hint
}

fn parse_reset_duration(value: &str) -> Option<Duration> {
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<f64>() {
        return (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs));
    }

    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut chars = value.chars().peekable();
    let mut matched = false;
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let amount: f64 = number.parse().ok()?;
        number.clear();
        let unit_secs = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                0.001
            }
            'h' => 3600.0,
            'm' => 60.0,
            's' => 1.0,
            _ => return None,
        };
        total += Duration::from_secs_f64(amount * unit_secs);
        matched = true;
    }
    if !number.is_empty() {
        return None;
    }
    matched.then_some(total)
}
