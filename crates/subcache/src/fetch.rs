//! An outbound HTTP client wrapper that caches responses.
//!
//! Responses are not serializable as such, so the wrapper stores a [`SerializedResponse`], the
//! decoded body together with the status line and headers, and rebuilds a [`CachedResponse`] from
//! it on every call. Callers see the same shape whether the response came from the network or the
//! store.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::caching::{
    CacheError, CacheRunner, CacheStore, CachingStrategy, DeferUntilSettled, KeyError,
    WithCacheOptions,
};

/// The header carrying the upstream request id, reported in [`FetchError::BodyDecode`].
const REQUEST_ID_HEADER: &str = "x-request-id";

/// An error of [`CacheRunner::fetch_with_server_cache`].
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url")]
    InvalidUrl(#[from] url::ParseError),
    #[error("invalid request method `{0}`")]
    InvalidMethod(String),
    #[error(transparent)]
    UnserializableKey(#[from] KeyError),
    /// The request could not be sent, or no response was received.
    #[error("upstream request failed")]
    Request(#[from] reqwest::Error),
    /// The response body could neither be decoded as requested nor as text.
    #[error(
        "upstream response code: {status} (request id: {})",
        .request_id.as_deref().unwrap_or("none")
    )]
    BodyDecode {
        status: u16,
        request_id: Option<String>,
    },
    /// A stored response cannot be turned back into a response.
    #[error("cached response is invalid: {0}")]
    InvalidResponse(String),
}

/// The parts of an outbound request.
///
/// This is serializable, as it is part of the default cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInit {
    pub method: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl Default for RequestInit {
    fn default() -> Self {
        Self {
            method: Method::GET.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }
}

impl RequestInit {
    /// A request with the given `method`.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Whether the request is a `GET`, the only method cached without an explicit strategy.
    pub fn is_get(&self) -> bool {
        self.method.is_empty() || self.method.eq_ignore_ascii_case("GET")
    }

    fn parse_method(&self) -> Result<Method, FetchError> {
        if self.method.is_empty() {
            return Ok(Method::GET);
        }
        Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| FetchError::InvalidMethod(self.method.clone()))
    }
}

/// How to decode a response body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnType {
    #[default]
    Json,
    Text,
    /// The raw bytes.
    Bytes,
}

/// A decoded response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "data")]
pub enum ResponseBody {
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
}

impl ResponseBody {
    /// Decodes `bytes` as `return_type`, falling back to text.
    ///
    /// Returns `None` if the body is neither valid as `return_type` nor valid UTF-8.
    pub fn decode(bytes: &[u8], return_type: ReturnType) -> Option<Self> {
        let primary = match return_type {
            ReturnType::Json => serde_json::from_slice(bytes).ok().map(Self::Json),
            ReturnType::Text => None,
            ReturnType::Bytes => Some(Self::Bytes(bytes.to_vec())),
        };
        primary.or_else(|| {
            std::str::from_utf8(bytes)
                .ok()
                .map(|text| Self::Text(text.to_owned()))
        })
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// The status line and headers of a response, in a serializable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseInit {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseInit {
    fn from_response(response: &reqwest::Response) -> Self {
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                let value = value.to_str().ok()?;
                Some((name.as_str().to_owned(), value.to_owned()))
            })
            .collect();

        Self {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            headers,
        }
    }
}

/// What the store persists for one HTTP sub-request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedResponse(pub ResponseBody, pub ResponseInit);

impl SerializedResponse {
    /// Rebuilds the body and response.
    pub fn to_response(&self) -> Result<(ResponseBody, CachedResponse), FetchError> {
        let response = CachedResponse::from_init(&self.1)?;
        Ok((self.0.clone(), response))
    }

    pub fn into_response(self) -> Result<(ResponseBody, CachedResponse), FetchError> {
        let response = CachedResponse::from_init(&self.1)?;
        Ok((self.0, response))
    }
}

/// A response rebuilt from a [`ResponseInit`].
#[derive(Debug, Clone)]
pub struct CachedResponse {
    status: StatusCode,
    status_text: String,
    headers: HeaderMap,
}

impl CachedResponse {
    fn from_init(init: &ResponseInit) -> Result<Self, FetchError> {
        let status = StatusCode::from_u16(init.status)
            .map_err(|_| FetchError::InvalidResponse(format!("status {}", init.status)))?;

        let mut headers = HeaderMap::with_capacity(init.headers.len());
        for (name, value) in &init.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| FetchError::InvalidResponse(format!("header name `{name}`")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| FetchError::InvalidResponse(format!("header value of `{name}`")))?;
            headers.append(name, value);
        }

        Ok(Self {
            status,
            status_text: init.status_text.clone(),
            headers,
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The value of the header `name`, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }
}

/// Decides whether a fetched response is written to the store.
pub type ShouldCacheResponse = Arc<dyn Fn(&ResponseBody, &CachedResponse) -> bool + Send + Sync>;

/// Options of [`CacheRunner::fetch_with_server_cache`].
#[derive(Default)]
pub struct FetchCacheOptions {
    /// The caching strategy.
    ///
    /// Defaults to the runner's default strategy for `GET` requests. Other requests are only
    /// cached with an explicit strategy.
    pub cache: Option<CachingStrategy>,
    /// The store. Without one, every call goes to the network.
    pub cache_instance: Option<Arc<dyn CacheStore>>,
    /// A key descriptor replacing the default `[url, request_init]`.
    pub cache_key: Option<Value>,
    /// Defaults to caching every response.
    pub should_cache_response: Option<ShouldCacheResponse>,
    pub defer: Option<Arc<dyn DeferUntilSettled>>,
    pub return_type: ReturnType,
}

impl std::fmt::Debug for FetchCacheOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchCacheOptions")
            .field("cache", &self.cache)
            .field("cache_instance", &self.cache_instance)
            .field("cache_key", &self.cache_key)
            .field(
                "should_cache_response",
                &self.should_cache_response.is_some(),
            )
            .field("defer", &self.defer)
            .field("return_type", &self.return_type)
            .finish()
    }
}

impl FetchCacheOptions {
    pub fn new(cache_instance: Arc<dyn CacheStore>) -> Self {
        Self {
            cache_instance: Some(cache_instance),
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: CachingStrategy) -> Self {
        self.cache = Some(strategy);
        self
    }

    pub fn with_cache_key(mut self, key: Value) -> Self {
        self.cache_key = Some(key);
        self
    }

    pub fn with_should_cache_response<F>(mut self, should_cache: F) -> Self
    where
        F: Fn(&ResponseBody, &CachedResponse) -> bool + Send + Sync + 'static,
    {
        self.should_cache_response = Some(Arc::new(should_cache));
        self
    }

    pub fn with_defer(mut self, defer: Arc<dyn DeferUntilSettled>) -> Self {
        self.defer = Some(defer);
        self
    }

    pub fn with_return_type(mut self, return_type: ReturnType) -> Self {
        self.return_type = return_type;
        self
    }
}

/// Returns `true` unless `body` is a JSON object with a truthy `errors` field.
///
/// GraphQL servers report errors with a `200` status, use this as
/// [`should_cache_response`](FetchCacheOptions::should_cache_response) to not cache them.
pub fn check_graphql_errors(body: &ResponseBody) -> bool {
    let errors = body.as_json().and_then(|json| json.get("errors"));
    !errors.is_some_and(is_truthy)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

impl CacheRunner {
    /// Fetches `url`, caching the decoded response.
    ///
    /// See [`run_with_cache`](Self::run_with_cache) for the caching semantics. Every call, cached or
    /// not, returns the body together with a response rebuilt from the stored status and headers.
    pub async fn fetch_with_server_cache(
        &self,
        client: &reqwest::Client,
        url: &str,
        request_init: RequestInit,
        options: FetchCacheOptions,
    ) -> Result<(ResponseBody, CachedResponse), FetchError> {
        let url = Url::parse(url)?;
        let method = request_init.parse_method()?;

        let strategy = match options.cache {
            Some(strategy) => Some(strategy),
            None if request_init.is_get() => Some(self.default_strategy()),
            None => None,
        };

        let key = match options.cache_key {
            Some(key) => key,
            None => serde_json::to_value((url.as_str(), &request_init))
                .map_err(|source| KeyError::Unserializable { index: 0, source })?,
        };

        let mut cache_options = WithCacheOptions::default().with_debug_url(url.clone());
        if let Some(cache) = options.cache_instance {
            cache_options = cache_options.with_cache(cache);
        }
        if let Some(strategy) = strategy {
            cache_options = cache_options.with_strategy(strategy);
        }
        if let Some(defer) = options.defer {
            cache_options = cache_options.with_defer(defer);
        }
        if let Some(should_cache) = options.should_cache_response {
            cache_options =
                cache_options.with_should_cache_result(move |serialized: &SerializedResponse| {
                    match serialized.to_response() {
                        Ok((body, response)) => should_cache(&body, &response),
                        Err(_) => false,
                    }
                });
        }

        let client = client.clone();
        let return_type = options.return_type;
        let action = move || fetch_serialized(client, method, url, request_init, return_type);

        let serialized = self
            .run_with_cache(&key, action, cache_options)
            .await
            .map_err(|e| match e {
                CacheError::UnserializableKey(e) => FetchError::from(e),
                CacheError::Compute(e) => e,
            })?;
        serialized.into_response()
    }
}

/// Sends the request and decodes the response.
async fn fetch_serialized(
    client: reqwest::Client,
    method: Method,
    url: Url,
    request_init: RequestInit,
    return_type: ReturnType,
) -> Result<SerializedResponse, FetchError> {
    let mut request = client.request(method, url);
    for (name, value) in &request_init.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request_init.body {
        request = request.body(body);
    }

    let response = request.send().await?;
    let init = ResponseInit::from_response(&response);
    let request_id = response
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let body_decode = || FetchError::BodyDecode {
        status: init.status,
        request_id: request_id.clone(),
    };
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(
                error = &e as &dyn std::error::Error,
                "Failed to read response body"
            );
            return Err(body_decode());
        }
    };
    let body = ResponseBody::decode(&bytes, return_type).ok_or_else(body_decode)?;

    Ok(SerializedResponse(body, init))
}
