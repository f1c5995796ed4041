//! Deployment platform API plumbing shared by the upload and finalize steps.

use crate::config::Credentials;
use crate::error::{DeployError, DeployResult};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub(crate) struct CloudflareApiMessage {
    code: Option<i64>,
    message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CloudflareApiResponse<T> {
    #[serde(default)]
    success: bool,
    result: Option<T>,
    errors: Option<Vec<CloudflareApiMessage>>,
    messages: Option<Vec<CloudflareApiMessage>>,
}

/// Authenticated handle on the platform API for one account.
#[derive(Debug, Clone)]
pub struct CloudflareClient {
    http: reqwest::Client,
    api_base: String,
    credentials: Credentials,
}

impl CloudflareClient {
    pub fn new(http: reqwest::Client, api_base: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn api_token(&self) -> &str {
        &self.credentials.api_token
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// Scripts root, nested under the dispatch namespace when one is given.
    pub fn script_path(&self, script_name: &str, dispatch_namespace: Option<&str>) -> String {
        match dispatch_namespace {
            Some(namespace) => format!(
                "/accounts/{}/workers/dispatch/namespaces/{}/scripts/{}",
                self.credentials.account_id, namespace, script_name
            ),
            None => format!(
                "/accounts/{}/workers/scripts/{}",
                self.credentials.account_id, script_name
            ),
        }
    }

    pub fn upload_session_url(&self, script_name: &str, dispatch_namespace: Option<&str>) -> String {
        self.url(&format!(
            "{}/assets-upload-session",
            self.script_path(script_name, dispatch_namespace)
        ))
    }

    pub fn assets_upload_url(&self) -> String {
        self.url(&format!(
            "/accounts/{}/workers/assets/upload",
            self.credentials.account_id
        ))
    }

    pub fn script_url(&self, script_name: &str, dispatch_namespace: Option<&str>) -> String {
        self.url(&self.script_path(script_name, dispatch_namespace))
    }
}

fn summarize_cloudflare_messages(
    errors: Option<&[CloudflareApiMessage]>,
    messages: Option<&[CloudflareApiMessage]>,
) -> String {
    let parts: Vec<String> = errors
        .into_iter()
        .chain(messages)
        .flatten()
        .map(|msg| match msg.code {
            Some(code) => format!("{} ({})", msg.message, code),
            None => msg.message.clone(),
        })
        .collect();
    if parts.is_empty() {
        "Unknown Cloudflare API error".to_string()
    } else {
        parts.join("; ")
    }
}

/// Decode a platform envelope, turning non-2xx statuses and `success: false`
/// into [`DeployError::Platform`] with the platform's own message text.
pub(crate) async fn parse_cloudflare_response<T: DeserializeOwned>(
    response: reqwest::Response,
    context: &str,
) -> DeployResult<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| DeployError::transport(context, e))?;

    if !status.is_success() {
        let message = match serde_json::from_str::<CloudflareApiResponse<Value>>(&body) {
            Ok(envelope) => summarize_cloudflare_messages(
                envelope.errors.as_deref(),
                envelope.messages.as_deref(),
            ),
            Err(_) => body,
        };
        return Err(DeployError::Platform {
            context: context.to_string(),
            status,
            message,
        });
    }

    let envelope: CloudflareApiResponse<Value> =
        serde_json::from_str(&body).map_err(|e| DeployError::UnexpectedResponse {
            context: context.to_string(),
            message: format!("{} (body: {})", e, body),
        })?;

    if !envelope.success {
        return Err(DeployError::Platform {
            context: context.to_string(),
            status,
            message: summarize_cloudflare_messages(
                envelope.errors.as_deref(),
                envelope.messages.as_deref(),
            ),
        });
    }

    // A missing result decodes as null so callers can ask for Option<T>.
    serde_json::from_value(envelope.result.unwrap_or(Value::Null)).map_err(|e| {
        DeployError::UnexpectedResponse {
            context: context.to_string(),
            message: format!("{} (body: {})", e, body),
        }
    })
}
