//! Asset upload session protocol.
//!
//! The platform answers the session request with the hashes it is missing,
//! partitioned into buckets. Buckets are uploaded strictly in order, each
//! authenticated with the current session token; a token returned by a batch
//! replaces it, and whatever token is current after the last batch is the
//! completion token handed to the finalizer.

use crate::cloudflare::{parse_cloudflare_response, CloudflareClient};
use crate::error::{DeployError, DeployResult};
use crate::manifest::{AssetBlobs, AssetManifest};
use base64::Engine;
use reqwest::multipart;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;

#[derive(Debug, Clone, Deserialize)]
pub struct AssetsUploadSession {
    pub jwt: Option<String>,
    #[serde(default)]
    pub buckets: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct AssetsUploadBucketResponse {
    jwt: Option<String>,
}

/// Where an upload session stands between platform calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    SessionCreated {
        jwt: String,
        pending: VecDeque<Vec<String>>,
    },
    Uploading {
        jwt: String,
        pending: VecDeque<Vec<String>>,
    },
    Completed {
        token: String,
    },
}

impl UploadState {
    /// A session with no buckets is already complete: its own jwt is the
    /// completion token.
    pub fn from_session(session: AssetsUploadSession) -> DeployResult<Self> {
        let jwt = session.jwt.ok_or_else(|| DeployError::UnexpectedResponse {
            context: "Start assets upload".to_string(),
            message: "session did not return an upload jwt".to_string(),
        })?;
        let pending: VecDeque<Vec<String>> = session
            .buckets
            .into_iter()
            .filter(|bucket| !bucket.is_empty())
            .collect();
        if pending.is_empty() {
            return Ok(Self::Completed { token: jwt });
        }
        Ok(Self::SessionCreated { jwt, pending })
    }

    /// The token to authenticate the next batch and the hashes in it.
    pub fn next_batch(&self) -> Option<(&str, &[String])> {
        match self {
            Self::SessionCreated { jwt, pending } | Self::Uploading { jwt, pending } => {
                pending.front().map(|bucket| (jwt.as_str(), bucket.as_slice()))
            }
            Self::Completed { .. } => None,
        }
    }

    /// Record a successful batch. A token in the batch response rotates the
    /// current one; after the last batch the current token completes the
    /// session.
    pub fn batch_uploaded(self, rotated: Option<String>) -> Self {
        match self {
            Self::SessionCreated { jwt, mut pending } | Self::Uploading { jwt, mut pending } => {
                pending.pop_front();
                let jwt = rotated.unwrap_or(jwt);
                if pending.is_empty() {
                    Self::Completed { token: jwt }
                } else {
                    Self::Uploading { jwt, pending }
                }
            }
            completed @ Self::Completed { .. } => completed,
        }
    }

    pub fn completion_token(&self) -> Option<&str> {
        match self {
            Self::Completed { token } => Some(token),
            _ => None,
        }
    }
}

/// Make sure every byte referenced by `manifest` exists on the platform.
///
/// Returns the completion token, or `None` when there are no assets.
pub async fn sync_assets(
    client: &CloudflareClient,
    script_name: &str,
    manifest: &AssetManifest,
    blobs: &AssetBlobs,
    dispatch_namespace: Option<&str>,
) -> DeployResult<Option<String>> {
    if manifest.is_empty() {
        return Ok(None);
    }

    let session = create_upload_session(client, script_name, manifest, dispatch_namespace).await?;
    tracing::info!(
        script = script_name,
        files = manifest.len(),
        buckets = session.buckets.len(),
        "assets upload session created"
    );

    let mut state = UploadState::from_session(session)?;
    let mut batch_index = 0usize;
    while let Some((jwt, hashes)) = state.next_batch() {
        batch_index += 1;
        let rotated = upload_bucket(client, script_name, batch_index, jwt, hashes, blobs).await?;
        state = state.batch_uploaded(rotated);
    }

    match state {
        UploadState::Completed { token } => Ok(Some(token)),
        _ => Err(DeployError::UnexpectedResponse {
            context: format!("Upload assets for {}", script_name),
            message: "upload session did not complete".to_string(),
        }),
    }
}

async fn create_upload_session(
    client: &CloudflareClient,
    script_name: &str,
    manifest: &AssetManifest,
    dispatch_namespace: Option<&str>,
) -> DeployResult<AssetsUploadSession> {
    let context = format!("Start assets upload for {}", script_name);
    let response = client
        .http()
        .post(client.upload_session_url(script_name, dispatch_namespace))
        .bearer_auth(client.api_token())
        .json(&json!({ "manifest": manifest }))
        .send()
        .await
        .map_err(|e| DeployError::transport(&context, e))?;
    parse_cloudflare_response(response, &context).await
}

async fn upload_bucket(
    client: &CloudflareClient,
    script_name: &str,
    batch_index: usize,
    jwt: &str,
    hashes: &[String],
    blobs: &AssetBlobs,
) -> DeployResult<Option<String>> {
    let context = format!("Upload assets bucket {} for {}", batch_index, script_name);

    // Base64 text inside a typed part keeps binary bytes intact and lets the
    // platform serve each asset with its declared MIME type.
    let mut form = multipart::Form::new();
    for hash in hashes {
        let blob = blobs
            .get(hash)
            .ok_or_else(|| DeployError::UnknownAssetHash(hash.clone()))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&blob.bytes);
        let part = multipart::Part::text(encoded)
            .file_name(hash.clone())
            .mime_str(&blob.content_type)
            .map_err(|e| DeployError::transport(&context, e))?;
        form = form.part(hash.clone(), part);
    }

    let response = client
        .http()
        .post(client.assets_upload_url())
        .bearer_auth(jwt)
        .query(&[("base64", "true")])
        .multipart(form)
        .send()
        .await
        .map_err(|e| DeployError::transport(&context, e))?;
    let status = response.status();
    let result: Option<AssetsUploadBucketResponse> =
        parse_cloudflare_response(response, &context).await?;
    tracing::debug!(
        script = script_name,
        batch = batch_index,
        files = hashes.len(),
        status = %status,
        "assets bucket uploaded"
    );
    Ok(result.and_then(|r| r.jwt))
}
