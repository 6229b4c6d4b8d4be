//! Shared HTTP plumbing: authenticated JSON requests, pagination and
//! status classification into `AdapterError`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use lmsh_core::{AdapterError, AdapterResult};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::RemoteError;

const USER_AGENT: &str = concat!("lmsh/", env!("CARGO_PKG_VERSION"));
const PER_PAGE: usize = 100;
const MAX_PAGES: usize = 50;
const MAX_MESSAGE_LEN: usize = 200;

/// Authenticated JSON client rooted at one base URL.
#[derive(Debug, Clone)]
pub(crate) struct HttpClient {
    client: Client,
    base_url: String,
}

impl HttpClient {
    pub(crate) fn new(
        base_url: &str,
        token: &str,
        timeout: Duration,
        extra_headers: &[(&'static str, &'static str)],
    ) -> Result<Self, RemoteError> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| RemoteError::InvalidToken)?;
        auth.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth);
        for (name, value) in extra_headers {
            headers.insert(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path))
    }

    /// Send and classify non-success statuses.
    async fn execute(&self, method: Method, path: &str, builder: RequestBuilder) -> AdapterResult<Response> {
        let response = builder.send().await.map_err(|e| transport_error(path, e))?;
        let status = response.status();
        debug!(method = %method, path = %path, status = %status.as_u16(), "remote request");
        if status.is_success() {
            return Ok(response);
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        let err = classify_status(status, &headers, &body);
        if let AdapterError::RateLimited { retry_after } = &err {
            warn!(path = %path, retry_after = ?retry_after, "rate limited by remote");
        }
        Err(err)
    }

    pub(crate) async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> AdapterResult<T> {
        let builder = self.request(Method::GET, path).query(query);
        let response = self.execute(Method::GET, path, builder).await?;
        decode(path, response).await
    }

    /// GET where 404 means "absent".
    pub(crate) async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> AdapterResult<Option<T>> {
        match self.get(path, &[]).await {
            Ok(value) => Ok(Some(value)),
            Err(AdapterError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Collect every page of a list endpoint using `page`/`per_page`.
    pub(crate) async fn get_pages<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> AdapterResult<Vec<T>> {
        let mut items = Vec::new();
        for page in 1..=MAX_PAGES {
            let mut params: Vec<(&str, String)> = query.to_vec();
            params.push(("per_page", PER_PAGE.to_string()));
            params.push(("page", page.to_string()));
            let batch: Vec<T> = self.get(path, &params).await?;
            let last = batch.len() < PER_PAGE;
            items.extend(batch);
            if last {
                return Ok(items);
            }
        }
        warn!(path = %path, pages = MAX_PAGES, "pagination limit reached, results truncated");
        Ok(items)
    }

    /// Send a JSON body and decode the JSON response.
    pub(crate) async fn send<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> AdapterResult<T> {
        let builder = self.request(method.clone(), path).json(body);
        let response = self.execute(method, path, builder).await?;
        decode(path, response).await
    }

    /// Send a JSON body, ignoring the response body.
    pub(crate) async fn send_empty<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> AdapterResult<()> {
        let builder = self.request(method.clone(), path).json(body);
        self.execute(method, path, builder).await?;
        Ok(())
    }
}

async fn decode<T: DeserializeOwned>(path: &str, response: Response) -> AdapterResult<T> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| transport_error(path, e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AdapterError::Protocol(format!("{path}: undecodable response: {e}")))
}

fn transport_error(path: &str, err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout(format!("{path}: {err}"))
    } else if err.is_decode() {
        AdapterError::Protocol(format!("{path}: {err}"))
    } else {
        AdapterError::Unavailable(format!("{path}: {err}"))
    }
}

/// Best-effort human message from an error body.
fn error_message(body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|json| {
        json.get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                json.get("errors")?
                    .as_array()?
                    .iter()
                    .find_map(|e| e.get("message").and_then(Value::as_str))
                    .map(str::to_string)
            })
    });
    let message = from_json.unwrap_or_else(|| body.trim().to_string());
    message.chars().take(MAX_MESSAGE_LEN).collect()
}

/// Parse a `Retry-After` value: delta seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let wait = at.with_timezone(&Utc) - Utc::now();
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}

/// Wait hint from `Retry-After`, else from GitHub's `x-ratelimit-reset`.
fn retry_hint(headers: &HeaderMap) -> Option<Duration> {
    if let Some(after) = headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
    {
        return Some(after);
    }
    let reset = headers
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())?;
    let wait = reset - Utc::now().timestamp();
    Some(Duration::from_secs(wait.max(0) as u64))
}

fn rate_limit_exhausted(headers: &HeaderMap, message: &str) -> bool {
    headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0")
        || headers.contains_key(header::RETRY_AFTER)
        || message.to_ascii_lowercase().contains("rate limit")
}

/// Map a non-success response onto the adapter error taxonomy.
///
/// | Status | Error |
/// |---|---|
/// | 429, or 403 with an exhausted rate limit | `RateLimited` |
/// | 401, other 403 | `Unauthorized` |
/// | 404 | `NotFound` |
/// | 409, 422 naming an existing resource | `AlreadyExists` |
/// | 408, 504 | `Timeout` |
/// | other 5xx | `Unavailable` |
/// | other 4xx | `Rejected` |
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> AdapterError {
    let message = error_message(body);
    let detail = format!("HTTP {}: {message}", status.as_u16());
    match status {
        StatusCode::TOO_MANY_REQUESTS => AdapterError::RateLimited {
            retry_after: retry_hint(headers),
        },
        StatusCode::FORBIDDEN if rate_limit_exhausted(headers, &message) => {
            AdapterError::RateLimited {
                retry_after: retry_hint(headers),
            }
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AdapterError::Unauthorized(detail),
        StatusCode::NOT_FOUND => AdapterError::NotFound(detail),
        StatusCode::CONFLICT => AdapterError::AlreadyExists(detail),
        StatusCode::UNPROCESSABLE_ENTITY if names_existing(body) => {
            AdapterError::AlreadyExists(detail)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => AdapterError::Timeout(detail),
        s if s.is_server_error() => AdapterError::Unavailable(detail),
        s if s.is_client_error() => AdapterError::Rejected(detail),
        _ => AdapterError::Protocol(detail),
    }
}

fn names_existing(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("already_exists")
        || lower.contains("already exists")
        || lower.contains("must be unique")
}
