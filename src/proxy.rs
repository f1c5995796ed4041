//! Reverse proxy to sandbox preview upstreams.
//!
//! Outbound requests carry the preview token and `x-forwarded-*` headers and
//! never carry hop-by-hop headers. Upstream failures are rendered as a fixed
//! HTML page so nothing from the upstream leaks to the client, except in
//! warmup mode, where 404/5xx responses are retried until a deadline and the
//! last real response is returned.

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, Request, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use bytes::Bytes;
use reqwest::Url;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;

use crate::preview::{strip_port, ResolvedPreview};

pub const ERROR_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head><title>Preview unavailable</title></head>\n<body>\n<h1>Preview unavailable</h1>\n<p>The development server did not respond. Try again in a moment.</p>\n</body>\n</html>\n";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PORT: &str = "x-forwarded-port";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Generic page for any upstream failure on the preview path.
pub fn error_page(status: StatusCode) -> Response {
    (status, Html(ERROR_PAGE)).into_response()
}

pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
    let name = name.as_str();
    name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("upgrade")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
}

/// Remove hop-by-hop headers, including any the `Connection` header names.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(&name);
    }

    let hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name))
        .cloned()
        .collect();
    for name in hop {
        headers.remove(&name);
    }
    headers.remove(header::CONTENT_LENGTH);
}

/// Append the inbound path and query to the base URL's path.
pub fn target_url(base: &str, path_and_query: &str) -> Option<Url> {
    let mut url = Url::parse(base).ok()?;
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };
    let joined = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url.set_query(query.filter(|q| !q.is_empty()));
    Some(url)
}

/// An inbound request, buffered so it can be replayed during warmup.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub host: String,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
}

impl ProxyRequest {
    pub async fn from_request(
        request: Request<Body>,
        host: String,
        client_ip: Option<IpAddr>,
        max_body_bytes: usize,
    ) -> Result<Self, axum::Error> {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, max_body_bytes).await?;
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        Ok(Self {
            method: parts.method,
            host,
            path_and_query,
            headers: parts.headers,
            body,
            client_ip,
        })
    }

    fn forwarded_proto(&self) -> String {
        self.headers
            .get(X_FORWARDED_PROTO)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "http".to_string())
    }

    fn forwarded_port(&self, proto: &str) -> String {
        match self.host.rsplit_once(':') {
            Some((_, port)) if strip_port(&self.host) != self.host => port.to_string(),
            _ if proto == "https" => "443".to_string(),
            _ => "80".to_string(),
        }
    }
}

/// Upstream answer, fully buffered.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamReply {
    pub(crate) async fn read(response: reqwest::Response) -> Result<Self, reqwest::Error> {
        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = response.bytes().await?;
        Ok(Self {
            status,
            headers,
            body,
        })
    }
}

impl IntoResponse for UpstreamReply {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WarmupPolicy {
    pub interval: Duration,
    pub deadline: Duration,
}

/// Whether a response suggests the dev server is still booting.
pub fn needs_warmup(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND || status.is_server_error()
}

#[derive(Debug, Clone)]
pub struct Forwarder {
    http: reqwest::Client,
    token_header: HeaderName,
    warmup: Option<WarmupPolicy>,
}

impl Forwarder {
    pub fn new(http: reqwest::Client, token_header: HeaderName, warmup: Option<WarmupPolicy>) -> Self {
        Self {
            http,
            token_header,
            warmup,
        }
    }

    /// Client suited for proxying: redirects are passed through, not followed.
    pub fn client() -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
    }

    pub fn token_header(&self) -> &HeaderName {
        &self.token_header
    }

    /// Headers sent upstream: inbound minus hop-by-hop, plus the preview token
    /// and forwarding headers.
    pub fn upstream_headers(&self, request: &ProxyRequest, token: &str) -> HeaderMap {
        let mut headers = request.headers.clone();
        strip_hop_by_hop(&mut headers);

        let proto = request.forwarded_proto();
        let port = request.forwarded_port(&proto);
        if let Ok(value) = HeaderValue::from_str(token) {
            headers.insert(self.token_header.clone(), value);
        }
        if let Ok(value) = HeaderValue::from_str(&proto) {
            headers.insert(X_FORWARDED_PROTO, value);
        }
        if let Ok(value) = HeaderValue::from_str(&request.host) {
            headers.insert(X_FORWARDED_HOST, value);
        }
        if let Ok(value) = HeaderValue::from_str(&port) {
            headers.insert(X_FORWARDED_PORT, value);
        }
        // An inbound chain is only extended, never passed through unverified.
        let Some(ip) = request.client_ip else {
            headers.remove(X_FORWARDED_FOR);
            return headers;
        };
        let chain = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing, ip),
            _ => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        headers
    }

    pub async fn forward(&self, upstream: &ResolvedPreview, request: &ProxyRequest) -> Response {
        let Some(url) = target_url(&upstream.url, &request.path_and_query) else {
            tracing::warn!(sandbox = %upstream.address, "preview upstream url is invalid");
            return error_page(StatusCode::INTERNAL_SERVER_ERROR);
        };
        let headers = self.upstream_headers(request, &upstream.token);

        match self.warmup {
            Some(policy) => match self.send_with_warmup(&url, request, &headers, policy).await {
                Ok(reply) => reply.into_response(),
                Err(error) => {
                    tracing::warn!(sandbox = %upstream.address, error = %error, "preview upstream unreachable");
                    error_page(StatusCode::INTERNAL_SERVER_ERROR)
                }
            },
            None => match self.send(&url, request, &headers).await {
                Ok(reply) if reply.status.as_u16() < 400 => reply.into_response(),
                Ok(reply) => {
                    tracing::warn!(sandbox = %upstream.address, status = %reply.status, "preview upstream error");
                    error_page(StatusCode::INTERNAL_SERVER_ERROR)
                }
                Err(error) => {
                    tracing::warn!(sandbox = %upstream.address, error = %error, "preview upstream unreachable");
                    error_page(StatusCode::INTERNAL_SERVER_ERROR)
                }
            },
        }
    }

    pub(crate) async fn send(
        &self,
        url: &Url,
        request: &ProxyRequest,
        headers: &HeaderMap,
    ) -> Result<UpstreamReply, reqwest::Error> {
        let mut builder = self
            .http
            .request(request.method.clone(), url.clone())
            .headers(headers.clone());
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }
        let response = builder.send().await?;
        UpstreamReply::read(response).await
    }

    /// Replay the request every `interval` while the upstream answers 404/5xx
    /// or is unreachable, returning the last result at the deadline.
    pub async fn send_with_warmup(
        &self,
        url: &Url,
        request: &ProxyRequest,
        headers: &HeaderMap,
        policy: WarmupPolicy,
    ) -> Result<UpstreamReply, reqwest::Error> {
        let deadline = Instant::now() + policy.deadline;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.send(url, request, headers).await;
            let retry = match &result {
                Ok(reply) => needs_warmup(reply.status),
                Err(_) => true,
            };
            if !retry || Instant::now() + policy.interval > deadline {
                return result;
            }
            tracing::debug!(attempt, url = %url.path(), "upstream warming up, retrying");
            tokio::time::sleep(policy.interval).await;
        }
    }
}
