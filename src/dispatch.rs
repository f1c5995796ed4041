//! Routing of non-preview traffic to published workers.

use async_trait::async_trait;

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::preview::strip_port;
use crate::proxy::{strip_hop_by_hop, target_url, ProxyRequest, UpstreamReply};

/// Worker selected for a request and the path it should see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTarget {
    pub name: String,
    pub path_and_query: String,
}

fn is_worker_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Worker named by the host alone, ignoring any path fallback.
pub fn worker_from_host(host: &str, config: &DispatchConfig) -> Option<String> {
    let host = strip_port(host).trim_end_matches('.').to_ascii_lowercase();
    if host.parse::<std::net::IpAddr>().is_ok() {
        return None;
    }

    let prefix = match config.root_domain.as_deref() {
        Some(root) => {
            let root = root.trim_matches('.').to_ascii_lowercase();
            host.strip_suffix(&root)?.strip_suffix('.')?.to_string()
        }
        None if host.split('.').count() >= 3 => host,
        None => return None,
    };
    let label = prefix.split('.').next()?;
    is_worker_name(label).then(|| label.to_string())
}

fn name_from_path(path_and_query: &str) -> Option<WorkerTarget> {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };
    let trimmed = path.trim_start_matches('/');
    let (name, rest) = match trimmed.split_once('/') {
        Some((name, rest)) => (name, rest),
        None => (trimmed, ""),
    };
    if !is_worker_name(name) {
        return None;
    }

    let mut forwarded = format!("/{}", rest);
    if let Some(query) = query {
        forwarded.push('?');
        forwarded.push_str(query);
    }
    Some(WorkerTarget {
        name: name.to_ascii_lowercase(),
        path_and_query: forwarded,
    })
}

/// Pick the worker for a request.
///
/// The first host label names the worker when the host sits under the root
/// domain (or has three or more labels when none is configured). Otherwise the
/// first path segment is used and stripped, if path fallback is enabled.
pub fn resolve_worker(host: &str, path_and_query: &str, config: &DispatchConfig) -> Option<WorkerTarget> {
    if let Some(name) = worker_from_host(host, config) {
        return Some(WorkerTarget {
            name,
            path_and_query: path_and_query.to_string(),
        });
    }
    if config.path_fallback {
        return name_from_path(path_and_query);
    }
    None
}

/// Forwards a request to a published worker by name.
#[async_trait]
pub trait WorkerDispatcher: Send + Sync {
    async fn fetch(&self, worker: &str, request: ProxyRequest) -> Result<UpstreamReply, DispatchError>;
}

/// Dispatcher reaching workers over HTTP at a templated URL.
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    http: reqwest::Client,
    template: String,
}

impl HttpDispatcher {
    pub fn new(http: reqwest::Client, template: impl Into<String>) -> Self {
        Self {
            http,
            template: template.into(),
        }
    }

    pub fn from_config(http: reqwest::Client, config: &DispatchConfig) -> Option<Self> {
        config
            .upstream_template
            .as_deref()
            .map(|template| Self::new(http, template))
    }

    pub fn worker_base(&self, worker: &str) -> String {
        self.template.replace("{name}", worker)
    }
}

#[async_trait]
impl WorkerDispatcher for HttpDispatcher {
    async fn fetch(&self, worker: &str, request: ProxyRequest) -> Result<UpstreamReply, DispatchError> {
        let base = self.worker_base(worker);
        let url = target_url(&base, &request.path_and_query)
            .ok_or_else(|| DispatchError::InvalidTarget(base.clone()))?;

        let mut headers = request.headers;
        strip_hop_by_hop(&mut headers);
        let mut builder = self.http.request(request.method, url).headers(headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await?;
        Ok(UpstreamReply::read(response).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, Method, StatusCode};
    use bytes::Bytes;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(root: Option<&str>, path_fallback: bool) -> DispatchConfig {
        DispatchConfig {
            root_domain: root.map(str::to_string),
            upstream_template: None,
            path_fallback,
        }
    }

    #[test]
    fn subdomain_of_root_names_the_worker() {
        let cfg = config(Some("apps.example.com"), true);
        let target = resolve_worker("Blog.apps.example.com:443", "/posts?page=2", &cfg).unwrap();
        assert_eq!(target.name, "blog");
        assert_eq!(target.path_and_query, "/posts?page=2");
    }

    #[test]
    fn foreign_host_falls_back_to_first_path_segment() {
        let cfg = config(Some("apps.example.com"), true);
        let target = resolve_worker("edge.internal", "/blog/posts/1?x=y", &cfg).unwrap();
        assert_eq!(target.name, "blog");
        assert_eq!(target.path_and_query, "/posts/1?x=y");

        let target = resolve_worker("apps.example.com", "/blog", &cfg).unwrap();
        assert_eq!(target.path_and_query, "/");
    }

    #[test]
    fn without_root_domain_three_labels_are_needed() {
        let cfg = config(None, false);
        assert_eq!(
            resolve_worker("shop.workers.example", "/", &cfg).unwrap().name,
            "shop"
        );
        assert!(resolve_worker("example.com", "/shop", &cfg).is_none());
        assert!(resolve_worker("10.0.0.12", "/", &cfg).is_none());
    }

    #[test]
    fn nothing_to_route_yields_none() {
        let cfg = config(Some("apps.example.com"), true);
        assert!(resolve_worker("localhost:8787", "/", &cfg).is_none());
        assert!(resolve_worker("localhost", "/bad%20name/x", &cfg).is_none());
        assert!(resolve_worker("localhost", "/docs", &config(None, false)).is_none());
    }

    #[tokio::test]
    async fn http_dispatcher_forwards_to_templated_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/workers/blog/posts"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("posts"))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher =
            HttpDispatcher::new(reqwest::Client::new(), format!("{}/workers/{{name}}", server.uri()));
        let request = ProxyRequest {
            method: Method::GET,
            host: "blog.apps.example.com".into(),
            path_and_query: "/posts?page=2".into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_ip: None,
        };
        let reply = dispatcher.fetch("blog", request).await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(&reply.body[..], b"posts");
    }
}
