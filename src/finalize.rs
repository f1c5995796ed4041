//! Script upload: the terminal step that makes a worker live.
//!
//! Once [`upload_script`] returns, the named script is resolvable by the
//! dispatcher. The caller updates its own deployment records afterwards.

use crate::bindings::WorkerBinding;
use crate::cloudflare::{parse_cloudflare_response, CloudflareClient};
use crate::error::{DeployError, DeployResult};
use reqwest::multipart;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const MAIN_MODULE: &str = "index.js";
const MODULE_MIME: &str = "application/javascript+module";

#[derive(Debug, Clone, Serialize)]
pub struct AssetsMetadata {
    pub jwt: String,
    pub config: Map<String, Value>,
}

/// The `metadata` part of the script upload.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptMetadata {
    pub main_module: String,
    pub compatibility_date: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub compatibility_flags: Vec<String>,
    /// Omitted rather than sent empty; the platform treats the two differently.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bindings: Option<Vec<WorkerBinding>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assets: Option<AssetsMetadata>,
}

impl ScriptMetadata {
    pub fn new(
        compatibility_date: &str,
        compatibility_flags: Vec<String>,
        mut bindings: Vec<WorkerBinding>,
        vars: &BTreeMap<String, String>,
        assets: Option<AssetsMetadata>,
    ) -> Self {
        bindings.extend(
            vars.iter()
                .map(|(name, value)| WorkerBinding::plain_text(name, value)),
        );
        Self {
            main_module: MAIN_MODULE.to_string(),
            compatibility_date: compatibility_date.to_string(),
            compatibility_flags,
            bindings: if bindings.is_empty() {
                None
            } else {
                Some(bindings)
            },
            assets,
        }
    }
}

/// PUT the worker bundle and its metadata to the (namespaced) scripts
/// endpoint. Any non-2xx surfaces the platform's error text.
pub async fn upload_script(
    client: &CloudflareClient,
    script_name: &str,
    metadata: &ScriptMetadata,
    worker_source: &str,
    dispatch_namespace: Option<&str>,
    additional_modules: &BTreeMap<String, String>,
) -> DeployResult<()> {
    let context = format!("Upload script {}", script_name);
    let metadata_text = serde_json::to_string(metadata)?;

    let metadata_part = multipart::Part::text(metadata_text)
        .mime_str("application/json")
        .map_err(|e| DeployError::transport(&context, e))?;
    let mut form = multipart::Form::new().part("metadata", metadata_part);

    let entrypoint_part = multipart::Part::text(worker_source.to_string())
        .file_name(MAIN_MODULE)
        .mime_str(MODULE_MIME)
        .map_err(|e| DeployError::transport(&context, e))?;
    form = form.part(MAIN_MODULE, entrypoint_part);

    // Keyed by file name so imports between modules resolve by name.
    for (module_name, source) in additional_modules {
        let part = multipart::Part::text(source.clone())
            .file_name(module_name.clone())
            .mime_str(MODULE_MIME)
            .map_err(|e| DeployError::transport(&context, e))?;
        form = form.part(module_name.clone(), part);
    }

    let response = client
        .http()
        .put(client.script_url(script_name, dispatch_namespace))
        .bearer_auth(client.api_token())
        .multipart(form)
        .send()
        .await
        .map_err(|e| DeployError::transport(&context, e))?;

    let _: Value = parse_cloudflare_response(response, &context).await?;
    tracing::info!(
        script = script_name,
        namespace = dispatch_namespace.unwrap_or("-"),
        modules = additional_modules.len() + 1,
        "script uploaded"
    );
    Ok(())
}
