//! Response cache keyed by request path and query.
//!
//! Only `GET` responses with status 200 and a known, bounded
//! `content-length` are stored. Hits are served without selecting a backend.

use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderValue, Method, Response, StatusCode};
use dashmap::DashMap;

use crate::config::CacheConfig;

#[derive(Debug, Clone)]
struct CachedResponse {
    headers: HeaderMap,
    body: Bytes,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct ResponseCache {
    entries: DashMap<String, CachedResponse>,
    ttl: Duration,
    max_body_bytes: usize,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_secs(config.ttl_secs),
            max_body_bytes: config.max_body_bytes,
        }
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    pub fn lookup(&self, method: &Method, key: &str) -> Option<Response<Body>> {
        self.lookup_at(method, key, Instant::now())
    }

    pub fn lookup_at(&self, method: &Method, key: &str, now: Instant) -> Option<Response<Body>> {
        if method != Method::GET {
            return None;
        }
        let entry = self.entries.get(key)?;
        if now >= entry.expires_at {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        let mut response = Response::new(Body::from(entry.body.clone()));
        *response.headers_mut() = entry.headers.clone();
        response
            .headers_mut()
            .insert("x-cache", HeaderValue::from_static("HIT"));
        Some(response)
    }

    /// Whether a response to `method` with these parts should be buffered and stored.
    pub fn is_cacheable(&self, method: &Method, status: StatusCode, headers: &HeaderMap) -> bool {
        method == Method::GET
            && status == StatusCode::OK
            && headers
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<usize>().ok())
                .is_some_and(|len| len <= self.max_body_bytes)
    }

    pub fn store(&self, key: String, headers: HeaderMap, body: Bytes) {
        self.store_at(key, headers, body, Instant::now());
    }

    pub fn store_at(&self, key: String, headers: HeaderMap, body: Bytes, now: Instant) {
        if body.len() > self.max_body_bytes {
            return;
        }
        tracing::debug!(key = %key, bytes = body.len(), "Cached response");
        self.entries.insert(
            key,
            CachedResponse {
                headers,
                body,
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expires_at);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
