//! # RustKit Net
//!
//! Network capability consumed by the RustKit offline worker.
//!
//! ## Design Goals
//!
//! 1. **Async HTTP**: Non-blocking network requests behind the [`Fetcher`] trait
//! 2. **Response classification**: `basic` / `cors` / `opaque` like the platform
//! 3. **Cheap duplication**: requests and responses share their body buffer
//!    when cloned, so one copy can be stored while the other is returned

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use url::Url;

pub mod origin;

pub use origin::Origin;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("CORS check failed for {0}")]
    Cors(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, as set by the page that issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level or frame navigation.
    Navigate,
    /// Cross-origin requests fail outright.
    SameOrigin,
    /// Cross-origin requests yield an opaque response.
    NoCors,
    /// Cross-origin requests are subject to CORS.
    #[default]
    Cors,
}

/// HTTP request.
///
/// Cloning duplicates the request; the body buffer is shared, not copied.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::Cors,
        }
    }

    /// Create a navigation request for a document.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Parse a URL and create a GET request for it.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Check if this is a navigation request.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// Platform classification of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseType {
    /// Same-origin; fully inspectable.
    Basic,
    /// Cross-origin, CORS-approved.
    Cors,
    /// Cross-origin no-cors; status, headers and body are hidden.
    Opaque,
    /// Manual redirect result; hidden.
    OpaqueRedirect,
    /// Network error.
    Error,
    /// Constructed locally, not fetched.
    #[default]
    Default,
}

impl ResponseType {
    /// Classify a fetched response from the request and the client origin.
    ///
    /// `client` is the origin of the context that issued the request. Without
    /// one, every response is treated as inspectable.
    pub fn classify(client: Option<&Origin>, request: &Request, final_url: &Url) -> Self {
        let Some(client) = client else {
            return ResponseType::Basic;
        };

        if request.is_navigation() || client.contains(final_url) {
            ResponseType::Basic
        } else if request.mode == RequestMode::NoCors {
            ResponseType::Opaque
        } else {
            ResponseType::Cors
        }
    }
}

/// HTTP response.
///
/// Reading the body consumes the response; clone it first when two readers
/// need it. Clones share the body buffer.
#[derive(Debug, Clone)]
pub struct Response {
    /// Final URL after redirects. `None` for locally constructed responses.
    pub url: Option<Url>,
    /// HTTP status; `0` for opaque and error responses.
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    pub redirected: bool,
    body: Bytes,
}

impl Response {
    /// Create a response with the given status and body.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            url: None,
            status,
            status_text: StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("")
                .to_string(),
            headers: HeaderMap::new(),
            response_type: ResponseType::Default,
            redirected: false,
            body: body.into(),
        }
    }

    /// Create a locally constructed `text/plain` 200 response.
    pub fn text_body(text: &str) -> Self {
        Self::new(200, Bytes::copy_from_slice(text.as_bytes())).with_header(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain;charset=UTF-8"),
        )
    }

    /// Set the final URL.
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the status text.
    pub fn with_status_text(mut self, status_text: impl Into<String>) -> Self {
        self.status_text = status_text.into();
        self
    }

    /// Strip everything a cross-origin no-cors caller may not observe.
    pub fn into_opaque(self) -> Self {
        Self {
            url: None,
            status: 0,
            status_text: String::new(),
            headers: HeaderMap::new(),
            response_type: ResponseType::Opaque,
            redirected: false,
            body: Bytes::new(),
        }
    }

    /// Check if request was successful (2xx). Opaque responses are never ok.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body length in bytes.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Parsed `Content-Type`, if present and valid.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// Get the body as bytes.
    pub fn bytes(self) -> Bytes {
        self.body
    }

    /// Get the body as text.
    pub fn text(self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// The network capability: issue a request, get a response or a failure.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}

/// Resource loader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Enable cookies.
    pub cookies_enabled: bool,
    /// Client timeout. `None` leaves requests to run until native failure.
    #[serde(with = "optional_secs")]
    pub timeout: Option<Duration>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: "RustKit/1.0".to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            max_redirects: 10,
            cookies_enabled: true,
            timeout: None,
        }
    }
}

mod optional_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// `reqwest`-backed [`Fetcher`].
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
    origin: Option<Origin>,
}

impl ResourceLoader {
    /// Create a new resource loader.
    ///
    /// `origin` is the origin of the controlled pages, used to classify
    /// responses as `basic`, `cors` or `opaque`.
    pub fn new(config: LoaderConfig, origin: Option<Origin>) -> Result<Self, NetError> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled);

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(origin = ?origin.as_ref().map(|o| o.serialize()), "ResourceLoader initialized");

        Ok(Self {
            client,
            config,
            origin,
        })
    }

    fn cors_allowed(&self, headers: &HeaderMap) -> bool {
        let Some(origin) = &self.origin else {
            return true;
        };
        match headers
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok())
        {
            Some("*") => true,
            Some(allowed) => allowed == origin.serialize(),
            None => false,
        }
    }
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        if request.mode == RequestMode::SameOrigin {
            if let Some(origin) = &self.origin {
                if !origin.contains(&request.url) {
                    warn!(url = %request.url, "Cross-origin request in same-origin mode");
                    return Err(NetError::Cors(request.url.to_string()));
                }
            }
        }

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        req_builder = req_builder.header("Accept-Language", &self.config.accept_language);

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        let response = req_builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let final_url = response.url().clone();
        let redirected = final_url != request.url;
        let response_type = ResponseType::classify(self.origin.as_ref(), &request, &final_url);

        if response_type == ResponseType::Cors && !self.cors_allowed(&headers) {
            warn!(url = %final_url, "Response rejected by CORS check");
            return Err(NetError::Cors(final_url.to_string()));
        }

        let body = response.bytes().await?;

        trace!(
            url = %final_url,
            status = %status,
            response_type = ?response_type,
            body_len = body.len(),
            "Response received"
        );

        let mut response = Response::new(status.as_u16(), body)
            .with_url(final_url)
            .with_type(response_type);
        response.headers = headers;
        response.redirected = redirected;

        if response_type == ResponseType::Opaque {
            return Ok(response.into_opaque());
        }
        Ok(response)
    }
}
