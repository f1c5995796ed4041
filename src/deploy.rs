//! Publishing a built application as a named worker.
//!
//! The pipeline is strictly sequential: manifest, upload session, batches in
//! order, then the script upload. Nothing is retried here; a failed deploy is
//! reported to the caller, which owns the retry policy. Asset bytes already
//! uploaded stay on the platform and are reused by the next attempt.

use crate::bindings::{translate_bindings, WorkerBinding, WranglerConfig};
use crate::cloudflare::CloudflareClient;
use crate::config::{Credentials, EdgeConfig};
use crate::error::{DeployError, DeployResult};
use crate::finalize::{upload_script, AssetsMetadata, ScriptMetadata};
use crate::manifest::{build_manifest, AssetBlobs, AssetManifest, BuiltAssets};
use crate::upload::sync_assets;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

const WRANGLER_CANDIDATES: &[&str] = &["wrangler.jsonc", "wrangler.json"];

/// Body of the deploy-trigger endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub wrangler_config: WranglerConfig,
    pub worker_content: String,
    pub assets_manifest: Option<AssetManifest>,
    /// Asset contents keyed by manifest path, base64 encoded.
    pub files: Option<HashMap<String, String>>,
    pub additional_modules: Option<BTreeMap<String, String>>,
    pub compatibility_flags: Option<Vec<String>>,
    pub assets_config: Option<Map<String, Value>>,
    pub dispatch_namespace: Option<String>,
    pub account_id: Option<String>,
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeployResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeployResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeployAssets {
    pub manifest: AssetManifest,
    pub blobs: AssetBlobs,
    pub routing_config: Map<String, Value>,
}

/// Everything the finalizer needs, resolved fresh for a single deploy.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub credentials: Credentials,
    pub script_name: String,
    pub compatibility_date: String,
    pub compatibility_flags: Vec<String>,
    pub worker_source: String,
    pub assets: Option<DeployAssets>,
    pub bindings: Vec<WorkerBinding>,
    pub vars: BTreeMap<String, String>,
    pub dispatch_namespace: Option<String>,
    pub additional_modules: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOutcome {
    pub script_name: String,
    pub dispatch_namespace: Option<String>,
    pub asset_files: usize,
    pub assets_uploaded: bool,
}

impl DeployConfig {
    fn assemble(
        wrangler: &WranglerConfig,
        credentials: Credentials,
        worker_source: String,
        assets: Option<DeployAssets>,
        compatibility_flags: Option<Vec<String>>,
        dispatch_namespace: Option<String>,
        additional_modules: BTreeMap<String, String>,
    ) -> DeployResult<Self> {
        let script_name = wrangler.name.trim().to_string();
        if script_name.is_empty() {
            return Err(DeployError::InvalidRequest(
                "wrangler config is missing worker name".to_string(),
            ));
        }
        let compatibility_date = wrangler
            .compatibility_date
            .clone()
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| {
                DeployError::InvalidRequest(format!("{} is missing compatibility_date", script_name))
            })?;

        let assets = assets.filter(|a| !a.manifest.is_empty());
        let bindings = translate_bindings(wrangler, assets.is_some());

        Ok(Self {
            credentials,
            script_name,
            compatibility_date,
            compatibility_flags: compatibility_flags
                .unwrap_or_else(|| wrangler.compatibility_flags.clone()),
            worker_source,
            assets,
            bindings,
            vars: wrangler.vars.clone(),
            dispatch_namespace: dispatch_namespace.filter(|ns| !ns.trim().is_empty()),
            additional_modules,
        })
    }

    /// Resolve a deploy-trigger request against the configured defaults.
    pub fn from_request(request: DeployRequest, config: &EdgeConfig) -> DeployResult<Self> {
        let credentials = Credentials::resolve(
            &config.cloudflare,
            request.account_id.as_deref(),
            request.api_token.as_deref(),
        )?;

        let wrangler_routing = request
            .wrangler_config
            .assets
            .as_ref()
            .map(|a| a.routing_config())
            .unwrap_or_default();

        let assets = match request.assets_manifest {
            Some(manifest) => {
                let files = decode_files(request.files.unwrap_or_default())?;
                let blobs = AssetBlobs::from_files_by_path(&manifest, files)?;
                Some(DeployAssets {
                    manifest,
                    blobs,
                    routing_config: request.assets_config.unwrap_or(wrangler_routing),
                })
            }
            None => None,
        };

        Self::assemble(
            &request.wrangler_config,
            credentials,
            request.worker_content,
            assets,
            request.compatibility_flags,
            request
                .dispatch_namespace
                .or_else(|| config.cloudflare.dispatch_namespace.clone()),
            request.additional_modules.unwrap_or_default(),
        )
    }

    pub fn from_project(
        project: LocalProject,
        credentials: Credentials,
        dispatch_namespace: Option<String>,
    ) -> DeployResult<Self> {
        let assets = project.assets.map(|built| DeployAssets {
            manifest: built.manifest,
            blobs: built.blobs,
            routing_config: project.routing_config,
        });
        Self::assemble(
            &project.wrangler,
            credentials,
            project.worker_source,
            assets,
            None,
            dispatch_namespace,
            project.additional_modules,
        )
    }
}

fn decode_files(files: HashMap<String, String>) -> DeployResult<HashMap<String, Vec<u8>>> {
    files
        .into_iter()
        .map(|(path, encoded)| {
            base64::engine::general_purpose::STANDARD
                .decode(encoded.as_bytes())
                .map(|bytes| (path.clone(), bytes))
                .map_err(|e| {
                    DeployError::InvalidRequest(format!("file {} is not valid base64: {}", path, e))
                })
        })
        .collect()
}

/// Run the whole pipeline for one deploy.
pub async fn run_deploy(
    http: &reqwest::Client,
    api_base: &str,
    deploy: DeployConfig,
) -> DeployResult<DeployOutcome> {
    let client = CloudflareClient::new(http.clone(), api_base, deploy.credentials.clone());
    let namespace = deploy.dispatch_namespace.as_deref();

    let mut asset_files = 0usize;
    let assets_metadata = match &deploy.assets {
        Some(assets) => {
            asset_files = assets.manifest.len();
            sync_assets(
                &client,
                &deploy.script_name,
                &assets.manifest,
                &assets.blobs,
                namespace,
            )
            .await?
            .map(|jwt| AssetsMetadata {
                jwt,
                config: assets.routing_config.clone(),
            })
        }
        None => None,
    };
    let assets_uploaded = assets_metadata.is_some();

    let metadata = ScriptMetadata::new(
        &deploy.compatibility_date,
        deploy.compatibility_flags.clone(),
        deploy.bindings.clone(),
        &deploy.vars,
        assets_metadata,
    );
    upload_script(
        &client,
        &deploy.script_name,
        &metadata,
        &deploy.worker_source,
        namespace,
        &deploy.additional_modules,
    )
    .await?;

    Ok(DeployOutcome {
        script_name: deploy.script_name,
        dispatch_namespace: deploy.dispatch_namespace,
        asset_files,
        assets_uploaded,
    })
}

/// A built project on disk, ready to deploy from the CLI.
#[derive(Debug, Clone)]
pub struct LocalProject {
    pub wrangler: WranglerConfig,
    pub worker_source: String,
    pub additional_modules: BTreeMap<String, String>,
    pub assets: Option<BuiltAssets>,
    pub routing_config: Map<String, Value>,
}

fn find_wrangler_config(project_dir: &Path) -> DeployResult<PathBuf> {
    WRANGLER_CANDIDATES
        .iter()
        .map(|name| project_dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            DeployError::InvalidRequest(format!(
                "No wrangler.jsonc or wrangler.json in {}",
                project_dir.display()
            ))
        })
}

fn module_name(path: &Path) -> DeployResult<String> {
    path.file_name()
        .and_then(|v| v.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            DeployError::InvalidRequest(format!(
                "Could not resolve module file name from {}",
                path.display()
            ))
        })
}

/// Load the wrangler config, worker bundle, extra modules and assets of a
/// built project.
pub fn load_project(
    project_dir: &Path,
    wrangler_path: Option<&Path>,
    module_paths: &[PathBuf],
) -> DeployResult<LocalProject> {
    let wrangler_path = match wrangler_path {
        Some(path) => path.to_path_buf(),
        None => find_wrangler_config(project_dir)?,
    };
    let raw_wrangler = fs::read_to_string(&wrangler_path)?;
    let wrangler: WranglerConfig = json5::from_str(&raw_wrangler).map_err(|e| {
        DeployError::InvalidRequest(format!("{}: {}", wrangler_path.display(), e))
    })?;

    let main = wrangler.main.as_deref().ok_or_else(|| {
        DeployError::InvalidRequest(format!("{} has no main entry", wrangler_path.display()))
    })?;
    let worker_source = fs::read_to_string(project_dir.join(main))?;

    let mut additional_modules = BTreeMap::new();
    for path in module_paths {
        let path = if path.is_absolute() {
            path.clone()
        } else {
            project_dir.join(path)
        };
        additional_modules.insert(module_name(&path)?, fs::read_to_string(&path)?);
    }

    let mut routing_config = Map::new();
    let assets = match wrangler.assets.as_ref() {
        Some(assets_config) => {
            routing_config = assets_config.routing_config();
            match assets_config.directory.as_deref() {
                Some(dir) => {
                    let assets_dir = project_dir.join(dir);
                    add_routing_files(&assets_dir, &mut routing_config)?;
                    Some(build_manifest(&assets_dir)?)
                }
                None => None,
            }
        }
        None => None,
    };

    Ok(LocalProject {
        wrangler,
        worker_source,
        additional_modules,
        assets,
        routing_config,
    })
}

fn add_routing_files(assets_dir: &Path, config: &mut Map<String, Value>) -> DeployResult<()> {
    for name in ["_redirects", "_headers"] {
        let path = assets_dir.join(name);
        if path.is_file() {
            config.insert(name.to_string(), Value::String(fs::read_to_string(&path)?));
        }
    }
    Ok(())
}
