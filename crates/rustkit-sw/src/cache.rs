//! Cache entries and a single named cache.

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderName, HeaderValue, Method};
use rustkit_net::{Request, Response, ResponseType};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Result, ServiceWorkerError};

/// Request identity inside a cache: the URL without its fragment.
///
/// Only `GET` requests have a key; the method is therefore implied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a URL.
    pub fn from_url(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(url.into())
    }

    /// Key for a request, or `None` when the method can never match.
    pub fn for_request(request: &Request) -> Option<Self> {
        (request.method == Method::GET).then(|| Self::from_url(&request.url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cached request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL (the cache key).
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response status text.
    #[serde(default)]
    pub status_text: String,

    /// Response headers. Repeated headers are joined with `", "`.
    pub headers: HashMap<String, String>,

    /// Response type at the time it was stored.
    #[serde(default)]
    pub response_type: ResponseType,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for storage, consuming it.
    ///
    /// Applies the platform's `Cache.put` rules: only `GET` requests, no
    /// partial content, no `Vary: *`, no network-error responses.
    pub fn from_response(request: &Request, response: Response) -> Result<Self> {
        let key = CacheKey::for_request(request).ok_or_else(|| {
            ServiceWorkerError::CacheError(format!(
                "request method '{}' is unsupported",
                request.method
            ))
        })?;

        if response.status == 206 {
            return Err(ServiceWorkerError::CacheError(
                "partial response (status 206) is unsupported".to_string(),
            ));
        }

        if response.response_type == ResponseType::Error {
            return Err(ServiceWorkerError::CacheError(
                "network error response cannot be stored".to_string(),
            ));
        }

        let vary_all = response
            .headers
            .get_all(http::header::VARY)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|v| v.trim() == "*");
        if vary_all {
            return Err(ServiceWorkerError::CacheError(
                "vary header contains *".to_string(),
            ));
        }

        let mut headers: HashMap<String, String> = HashMap::new();
        for (name, value) in response.headers.iter() {
            let Ok(value) = value.to_str() else {
                continue;
            };
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }

        Ok(Self {
            url: key.0,
            method: request.method.to_string(),
            status: response.status,
            status_text: response.status_text.clone(),
            headers,
            response_type: response.response_type,
            body: response.bytes(),
            cached_at: now_millis(),
        })
    }

    /// Key under which this entry is stored.
    pub fn key(&self) -> CacheKey {
        CacheKey(self.url.clone())
    }

    /// Rebuild a response from this entry. The body buffer is shared.
    pub fn to_response(&self) -> Response {
        let mut response = Response::new(self.status, self.body.clone())
            .with_type(self.response_type)
            .with_status_text(self.status_text.clone());

        if let Ok(url) = Url::parse(&self.url) {
            response = response.with_url(url);
        }

        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                response.headers.insert(n, v);
            }
        }

        response
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// A cache instance.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries by key.
    entries: HashMap<CacheKey, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request. Non-GET requests never match.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        CacheKey::for_request(request).and_then(|key| self.entries.get(&key))
    }

    /// Add or replace an entry (last write wins).
    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key(), entry);
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Get all keys, sorted.
    pub fn keys(&self) -> Vec<&CacheKey> {
        let mut keys: Vec<_> = self.entries.keys().collect();
        keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
