//! Configuration record for a single rate limiting rule.

use actix_web::http::header::HeaderName;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while validating a rate limit configuration.
///
/// These are fatal: a limiter is never constructed from an invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("window_length must be positive")]
    ZeroWindowLength,
    #[error("window_length is too large")]
    WindowLengthOverflow,
    #[error("max_requests must be positive")]
    ZeroMaxRequests,
    #[error("Invalid header name for key_source: {0:?}")]
    InvalidHeaderName(String),
}

/// How the rate limiting key is derived from an incoming request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeySource {
    /// The caller's network address, without the port.
    #[default]
    Address,
    /// The value of the named request header.
    ///
    /// Requests without the header (or with an empty value) are not rate limited.
    Header(HeaderName),
}

impl FromStr for KeySource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("address") {
            return Ok(KeySource::Address);
        }
        HeaderName::from_str(s)
            .map(KeySource::Header)
            .map_err(|_| ConfigError::InvalidHeaderName(s.to_owned()))
    }
}

impl TryFrom<String> for KeySource {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeySource> for String {
    fn from(source: KeySource) -> Self {
        source.to_string()
    }
}

impl Display for KeySource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Address => write!(f, "address"),
            KeySource::Header(name) => write!(f, "{}", name),
        }
    }
}

/// A rate limiting rule, supplied once before traffic starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Length of each counting window, in seconds.
    pub window_length_seconds: u64,

    /// Maximum number of requests allowed per key within a sliding window.
    pub max_requests: u64,

    /// Where the rate limiting key comes from.
    #[serde(default)]
    pub key_source: KeySource,
}

impl RateLimitConfig {
    pub fn new(window_length_seconds: u64, max_requests: u64, key_source: KeySource) -> Self {
        Self {
            window_length_seconds,
            max_requests,
            key_source,
        }
    }

    pub fn window_length(&self) -> Duration {
        Duration::from_secs(self.window_length_seconds)
    }

    /// Check that the window length and request ceiling are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate(self.window_length(), self.max_requests)
    }
}

pub(crate) fn validate(window_length: Duration, max_requests: u64) -> Result<(), ConfigError> {
    if window_length.is_zero() {
        return Err(ConfigError::ZeroWindowLength);
    }
    if max_requests == 0 {
        return Err(ConfigError::ZeroMaxRequests);
    }
    Ok(())
}
