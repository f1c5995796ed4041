//! Sandbox control plane client.

use crate::config::SandboxConfig;
use crate::error::{ConfigError, PreviewError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

/// Authenticated upstream address for one sandbox port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PortPreview {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SandboxInfo {
    pub id: String,
    pub state: String,
}

impl SandboxInfo {
    /// Whether the sandbox must be started before it can serve previews.
    pub fn is_stopped(&self) -> bool {
        matches!(self.state.as_str(), "stopped" | "archived")
    }
}

#[async_trait]
pub trait SandboxControlPlane: Send + Sync {
    async fn get_port_preview_url(
        &self,
        sandbox_id: &str,
        port: u16,
    ) -> Result<PortPreview, PreviewError>;

    async fn get_sandbox(&self, sandbox_id: &str) -> Result<SandboxInfo, PreviewError>;

    async fn start_sandbox(&self, sandbox_id: &str) -> Result<(), PreviewError>;
}

/// REST control plane authenticated with a bearer API key.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl HttpControlPlane {
    pub fn new(http: reqwest::Client, api_url: &str, api_key: &str) -> Self {
        Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn from_config(http: reqwest::Client, config: &SandboxConfig) -> Result<Self, ConfigError> {
        let api_url = config
            .api_url
            .as_deref()
            .ok_or(ConfigError::Missing("sandbox.api_url"))?;
        let api_key = config
            .api_key
            .as_deref()
            .ok_or(ConfigError::Missing("sandbox.api_key"))?;
        Ok(Self::new(http, api_url, api_key))
    }

    fn check(
        response: reqwest::Response,
        sandbox_id: &str,
        action: &str,
    ) -> Result<reqwest::Response, PreviewError> {
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(PreviewError::SandboxNotFound(sandbox_id.to_string())),
            status => Err(PreviewError::Status {
                action: action.to_string(),
                status,
            }),
        }
    }
}

#[async_trait]
impl SandboxControlPlane for HttpControlPlane {
    async fn get_port_preview_url(
        &self,
        sandbox_id: &str,
        port: u16,
    ) -> Result<PortPreview, PreviewError> {
        let url = format!(
            "{}/sandbox/{}/ports/{}/preview-url",
            self.api_url, sandbox_id, port
        );
        let response = self.http.get(&url).bearer_auth(&self.api_key).send().await?;
        let response = Self::check(response, sandbox_id, "get port preview url")?;
        Ok(response.json().await?)
    }

    async fn get_sandbox(&self, sandbox_id: &str) -> Result<SandboxInfo, PreviewError> {
        let url = format!("{}/sandbox/{}", self.api_url, sandbox_id);
        let response = self.http.get(&url).bearer_auth(&self.api_key).send().await?;
        let response = Self::check(response, sandbox_id, "get sandbox")?;
        Ok(response.json().await?)
    }

    async fn start_sandbox(&self, sandbox_id: &str) -> Result<(), PreviewError> {
        let url = format!("{}/sandbox/{}/start", self.api_url, sandbox_id);
        let response = self.http.post(&url).bearer_auth(&self.api_key).send().await?;
        Self::check(response, sandbox_id, "start sandbox")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetches_port_preview_with_bearer_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sandbox/abc/ports/3000/preview-url"))
            .and(header("Authorization", "Bearer key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "url": "https://3000-abc.proxy.example.net",
                "token": "preview-token",
                "sandboxId": "abc"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let plane = HttpControlPlane::new(reqwest::Client::new(), &server.uri(), "key");
        let preview = plane.get_port_preview_url("abc", 3000).await.unwrap();
        assert_eq!(preview.url, "https://3000-abc.proxy.example.net");
        assert_eq!(preview.token, "preview-token");
    }

    #[tokio::test]
    async fn unknown_sandbox_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sandbox/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let plane = HttpControlPlane::new(reqwest::Client::new(), &server.uri(), "key");
        let err = plane.get_sandbox("missing").await.unwrap_err();
        assert!(matches!(err, PreviewError::SandboxNotFound(id) if id == "missing"));
    }

    #[test]
    fn missing_api_url_is_a_config_error() {
        let err = HttpControlPlane::from_config(reqwest::Client::new(), &SandboxConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("sandbox.api_url")));
    }
}
