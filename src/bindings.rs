use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Declarative deployment descriptor (wrangler.json / wrangler.jsonc).
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct WranglerConfig {
    pub name: String,
    pub main: Option<String>,
    pub compatibility_date: Option<String>,
    #[serde(default)]
    pub compatibility_flags: Vec<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    pub assets: Option<WranglerAssetsConfig>,
    pub durable_objects: Option<WranglerDurableObjectsConfig>,
    #[serde(default)]
    pub kv_namespaces: Vec<WranglerKvNamespaceBinding>,
    #[serde(default)]
    pub d1_databases: Vec<WranglerD1DatabaseBinding>,
    #[serde(default)]
    pub r2_buckets: Vec<WranglerR2BucketBinding>,
    #[serde(default)]
    pub services: Vec<WranglerServiceBinding>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct WranglerDurableObjectsConfig {
    #[serde(default)]
    pub bindings: Vec<WranglerDurableObjectBinding>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WranglerDurableObjectBinding {
    pub name: String,
    pub class_name: String,
    pub script_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WranglerKvNamespaceBinding {
    pub binding: String,
    pub id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WranglerD1DatabaseBinding {
    pub binding: String,
    pub database_name: Option<String>,
    pub database_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WranglerR2BucketBinding {
    pub binding: String,
    pub bucket_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WranglerServiceBinding {
    pub binding: String,
    pub service: String,
    pub environment: Option<String>,
    pub entrypoint: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct WranglerAssetsConfig {
    pub directory: Option<String>,
    pub binding: Option<String>,
    pub html_handling: Option<String>,
    pub not_found_handling: Option<String>,
    pub run_worker_first: Option<Value>,
}

impl WranglerAssetsConfig {
    /// Routing behaviour sent alongside the completion token at finalize time.
    pub fn routing_config(&self) -> Map<String, Value> {
        let mut config = Map::new();
        if let Some(html_handling) = &self.html_handling {
            config.insert(
                "html_handling".to_string(),
                Value::String(html_handling.clone()),
            );
        }
        if let Some(not_found_handling) = &self.not_found_handling {
            config.insert(
                "not_found_handling".to_string(),
                Value::String(not_found_handling.clone()),
            );
        }
        if let Some(run_worker_first) = &self.run_worker_first {
            config.insert("run_worker_first".to_string(), run_worker_first.clone());
        }
        config
    }
}

/// One entry of the script metadata `bindings` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerBinding {
    pub name: String,
    #[serde(rename = "type")]
    pub binding_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl WorkerBinding {
    fn new(name: &str, binding_type: &str) -> Self {
        Self {
            name: name.to_string(),
            binding_type: binding_type.to_string(),
            class_name: None,
            script_name: None,
            namespace_id: None,
            database_id: None,
            bucket_name: None,
            service: None,
            environment: None,
            entrypoint: None,
            text: None,
        }
    }

    pub fn plain_text(name: &str, text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Self::new(name, "plain_text")
        }
    }
}

/// Translate the declared bindings into script metadata descriptors.
///
/// Order is fixed: durable objects, KV, D1, R2, services, then the assets
/// binding when assets were uploaded and the config names one.
pub fn translate_bindings(config: &WranglerConfig, has_assets: bool) -> Vec<WorkerBinding> {
    let mut bindings = Vec::new();

    if let Some(durable_objects) = &config.durable_objects {
        for binding in &durable_objects.bindings {
            bindings.push(WorkerBinding {
                class_name: Some(binding.class_name.clone()),
                script_name: binding.script_name.clone(),
                ..WorkerBinding::new(&binding.name, "durable_object_namespace")
            });
        }
    }

    for kv in &config.kv_namespaces {
        bindings.push(WorkerBinding {
            namespace_id: Some(kv.id.clone()),
            ..WorkerBinding::new(&kv.binding, "kv_namespace")
        });
    }

    for d1 in &config.d1_databases {
        bindings.push(WorkerBinding {
            database_id: Some(d1.database_id.clone()),
            ..WorkerBinding::new(&d1.binding, "d1")
        });
    }

    for r2 in &config.r2_buckets {
        bindings.push(WorkerBinding {
            bucket_name: Some(r2.bucket_name.clone()),
            ..WorkerBinding::new(&r2.binding, "r2_bucket")
        });
    }

    for service in &config.services {
        bindings.push(WorkerBinding {
            service: Some(service.service.clone()),
            environment: service.environment.clone(),
            entrypoint: service.entrypoint.clone(),
            ..WorkerBinding::new(&service.binding, "service")
        });
    }

    if has_assets {
        if let Some(binding) = config.assets.as_ref().and_then(|a| a.binding.as_deref()) {
            bindings.push(WorkerBinding::new(binding, "assets"));
        }
    }

    bindings
}
