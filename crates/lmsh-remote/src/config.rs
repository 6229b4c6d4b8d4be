//! Credentials and endpoints for the remote adapters.

use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Errors raised while configuring an adapter.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{0} environment variable not set")]
    MissingEnv(&'static str),

    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("token contains characters not allowed in an HTTP header")]
    InvalidToken,

    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
}

fn required<F>(lookup: &F, name: &'static str) -> Result<String, RemoteError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(RemoteError::MissingEnv(name))
}

fn timeout_secs<F>(lookup: &F, name: &'static str) -> Result<u64, RemoteError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(DEFAULT_TIMEOUT_SECS),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or(RemoteError::InvalidValue { name, value: raw }),
    }
}

pub(crate) fn validate_url(url: &str) -> Result<String, RemoteError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| RemoteError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RemoteError::InvalidUrl {
            url: url.to_string(),
            reason: "expected http or https".to_string(),
        });
    }
    Ok(url.trim_end_matches('/').to_string())
}

/// GitHub API access.
#[derive(Clone)]
pub struct GitHubConfig {
    pub token: String,
    pub api_url: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("token", &"***")
            .field("api_url", &self.api_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl GitHubConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_url: DEFAULT_GITHUB_API_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Point at another API root (GitHub Enterprise, test servers).
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// `GITHUB_TOKEN` (required), `GITHUB_API_URL`, `GITHUB_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, RemoteError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, RemoteError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = required(&lookup, "GITHUB_TOKEN")?;
        let api_url = lookup("GITHUB_API_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string());
        Ok(Self {
            token,
            api_url: validate_url(api_url.trim())?,
            timeout: Duration::from_secs(timeout_secs(&lookup, "GITHUB_TIMEOUT_SECS")?),
        })
    }
}

/// LMS REST API access.
#[derive(Clone)]
pub struct LmsConfig {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for LmsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmsConfig")
            .field("base_url", &self.base_url)
            .field("token", &"***")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl LmsConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// `LMS_BASE_URL` and `LMS_TOKEN` (both required), `LMS_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, RemoteError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, RemoteError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = required(&lookup, "LMS_BASE_URL")?;
        let token = required(&lookup, "LMS_TOKEN")?;
        Ok(Self {
            base_url: validate_url(&base_url)?,
            token,
            timeout: Duration::from_secs(timeout_secs(&lookup, "LMS_TIMEOUT_SECS")?),
        })
    }
}
