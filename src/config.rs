//! Client configuration

use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::auth::TokenPolicy;

/// Base URL used when none is configured
pub const DEFAULT_BASE_URL: &str = "http://localhost:3000/api";

/// Errors in the client configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The base URL is not an absolute http(s) URL
    #[error("Invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },
}

/// Settings for an `ApiClient`
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Every request path is appended to this URL
    pub base_url: String,
    /// Per-attempt timeout, after which the attempt counts as a network failure
    pub timeout: Duration,
    /// TTL for cached GET responses
    pub cache_ttl: Duration,
    /// Token lifetime and refresh warning window
    pub token_policy: TokenPolicy,
    pub login_path: String,
    pub refresh_path: String,
    pub profile_path: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(300), // 5 minutes
            token_policy: TokenPolicy::default(),
            login_path: "/auth/login".to_string(),
            refresh_path: "/auth/refresh".to_string(),
            profile_path: "/users/profile".to_string(),
        }
    }
}

impl ClientConfig {
    /// Default configuration against `base_url`
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Checks that the base URL is an absolute http(s) URL
    pub fn validate(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason,
        };

        let url = Url::parse(&self.base_url).map_err(|e| invalid(e.to_string()))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(invalid(format!("unsupported scheme '{}'", other))),
        }
    }
}
