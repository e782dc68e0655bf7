//! Upstream forwarding.
//!
//! # Responsibilities
//! - Rewrite the request URI to the chosen backend
//! - Strip hop-by-hop headers, append `x-forwarded-for`
//! - Bound the upstream exchange with a timeout
//!
//! The response body is streamed back; nothing is buffered here.

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use axum::body::Body;
use axum::http::{
    header,
    uri::{Authority, Scheme},
    HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri,
};
use axum::response::IntoResponse;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use thiserror::Error;

use crate::http::request::X_REQUEST_ID;
use crate::load_balancer::Backend;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid upstream uri: {0}")]
    InvalidUri(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),
}

impl ForwardError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::InvalidUri(_) | Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> axum::response::Response {
        let message = match self {
            Self::Timeout(_) => "Upstream timed out",
            _ => "Upstream request failed",
        };
        (self.status(), message).into_response()
    }
}

#[derive(Debug, Clone)]
pub struct Forwarder {
    client: Client<HttpConnector, Body>,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { client, timeout }
    }

    /// Send `request` to `backend` and return its response.
    pub async fn forward(
        &self,
        request: Request<Body>,
        backend: &Backend,
        client_ip: IpAddr,
        request_id: &str,
    ) -> Result<Response<Body>, ForwardError> {
        let (mut parts, body) = request.into_parts();

        parts.uri = upstream_uri(&parts.uri, &backend.address())?;
        strip_hop_by_hop(&mut parts.headers);
        append_forwarded_for(&mut parts.headers, client_ip);
        if let Ok(value) = HeaderValue::from_str(request_id) {
            parts.headers.insert(X_REQUEST_ID, value);
        }

        let upstream = Request::from_parts(parts, body);
        let response: hyper::Response<hyper::body::Incoming> =
            tokio::time::timeout(self.timeout, self.client.request(upstream))
                .await
                .map_err(|_| ForwardError::Timeout(self.timeout))?
                .map_err(|e| ForwardError::Upstream(e.to_string()))?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

/// `http://{address}{path?query}`.
pub fn upstream_uri(original: &Uri, address: &str) -> Result<Uri, ForwardError> {
    let mut parts = original.clone().into_parts();
    parts.scheme = Some(Scheme::HTTP);
    parts.authority =
        Some(Authority::from_str(address).map_err(|e| ForwardError::InvalidUri(e.to_string()))?);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some("/".parse().map_err(|e: axum::http::uri::InvalidUri| {
            ForwardError::InvalidUri(e.to_string())
        })?);
    }
    Uri::from_parts(parts).map_err(|e| ForwardError::InvalidUri(e.to_string()))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // headers named by Connection are hop-by-hop too
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_str(name.trim()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_authority_and_keeps_path() {
        let original: Uri = "/items?page=2".parse().unwrap();
        let uri = upstream_uri(&original, "10.0.0.5:3000").unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.5:3000/items?page=2");

        let absolute: Uri = "https://edge.example/a".parse().unwrap();
        let uri = upstream_uri(&absolute, "backend:80").unwrap();
        assert_eq!(uri.to_string(), "http://backend:80/a");
    }

    #[test]
    fn strips_connection_scoped_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-secret"));
        headers.insert("x-secret", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[test]
    fn forwarded_for_is_appended() {
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, "192.0.2.1".parse().unwrap());
        append_forwarded_for(&mut headers, "198.51.100.2".parse().unwrap());
        assert_eq!(headers[&X_FORWARDED_FOR], "192.0.2.1, 198.51.100.2");
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            ForwardError::Timeout(Duration::from_secs(1)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(ForwardError::Upstream("refused".into()).status(), StatusCode::BAD_GATEWAY);
    }
}
