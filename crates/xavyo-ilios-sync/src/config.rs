//! Connection and sync settings for the Ilios API.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use url::Url;

use crate::error::IliosError;
use crate::expander::DEFAULT_MAX_DEPTH;
use crate::reconciler::RemovalPolicy;

const DEFAULT_API_VERSION: &str = "v3";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_BATCH_SIZE: usize = 500;

/// Ilios API access token.
///
/// The [`Debug`] impl redacts the token value.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ApiToken(String);

impl ApiToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Raw token for the `Authorization` header.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Expiry taken from the `exp` claim when the token is a JWT.
    ///
    /// Opaque tokens and JWTs without `exp` return `None`.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let mut parts = self.0.split('.');
        let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }

        let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
        let exp = claims.get("exp")?.as_i64()?;
        DateTime::from_timestamp(exp, 0)
    }

    /// Whether the token has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|exp| exp <= now)
    }
}

impl fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiToken([REDACTED])")
    }
}

/// Settings handed to [`IliosClient`](crate::client::IliosClient) and the sync driver.
#[derive(Debug, Clone, Deserialize)]
pub struct IliosConfig {
    /// Base URL of the Ilios installation, e.g. `https://ilios.example.edu`.
    pub host_url: Url,

    /// API access token.
    pub api_token: ApiToken,

    /// API version path segment.
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum ids per batch request; larger batches are split.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Maximum learner-group nesting depth followed during expansion.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// What happens to enrolments that are no longer backed by Ilios.
    #[serde(default)]
    pub removal_policy: RemovalPolicy,
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

fn default_max_depth() -> u32 {
    DEFAULT_MAX_DEPTH
}

impl IliosConfig {
    /// Create a configuration with default settings.
    pub fn new(host_url: &str, api_token: ApiToken) -> Result<Self, ConfigError> {
        let host_url = Url::parse(host_url)
            .map_err(|e| ConfigError::InvalidValue("host_url".into(), e.to_string()))?;

        let config = Self {
            host_url,
            api_token,
            api_version: default_api_version(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_depth: DEFAULT_MAX_DEPTH,
            removal_policy: RemovalPolicy::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load configuration from a custom variable reader.
    ///
    /// Tests supply variables this way without touching process environment.
    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host_url =
            reader("ILIOS_HOST_URL").map_err(|_| ConfigError::MissingVar("ILIOS_HOST_URL".into()))?;

        let api_token = reader("ILIOS_API_KEY")
            .map(ApiToken::new)
            .map_err(|_| ConfigError::MissingVar("ILIOS_API_KEY".into()))?;

        let mut config = Self::new(&host_url, api_token)?;

        if let Ok(version) = reader("ILIOS_API_VERSION") {
            config.api_version = version;
        }

        config.request_timeout_secs = parse_var(
            &reader,
            "ILIOS_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?;
        config.max_batch_size = parse_var(&reader, "ILIOS_MAX_BATCH_SIZE", DEFAULT_MAX_BATCH_SIZE)?;
        config.max_depth = parse_var(&reader, "ILIOS_MAX_DEPTH", DEFAULT_MAX_DEPTH)?;
        config.removal_policy = parse_var(&reader, "ILIOS_REMOVAL_POLICY", RemovalPolicy::default())?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.host_url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidValue(
                "host_url".into(),
                format!("unsupported scheme '{}'", self.host_url.scheme()),
            ));
        }
        if self.api_token.expose().trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "api_token".into(),
                "must not be empty".into(),
            ));
        }
        if self.api_version.trim().is_empty() || self.api_version.contains('/') {
            return Err(ConfigError::InvalidValue(
                "api_version".into(),
                format!("invalid version segment '{}'", self.api_version),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "max_batch_size".into(),
                "must be at least 1".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "request_timeout_secs".into(),
                "must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Root of the versioned API, without a trailing slash.
    #[must_use]
    pub fn api_base_url(&self) -> String {
        format!(
            "{}/api/{}",
            self.host_url.as_str().trim_end_matches('/'),
            self.api_version
        )
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    #[must_use]
    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    #[must_use]
    pub fn with_removal_policy(mut self, policy: RemovalPolicy) -> Self {
        self.removal_policy = policy;
        self
    }
}

fn parse_var<F, T>(reader: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match reader(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl From<ConfigError> for IliosError {
    fn from(e: ConfigError) -> Self {
        IliosError::Config(e.to_string())
    }
}
