use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8787";
pub const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";
pub const DEFAULT_SANDBOX_PORT: u16 = 3000;
pub const DEFAULT_TOKEN_HEADER: &str = "x-daytona-preview-token";

/// Edge configuration loaded from ~/.config/sandbox-edge/config.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Deployment platform credentials
    #[serde(default)]
    pub cloudflare: CloudflareConfig,

    /// Sandbox control plane settings
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Preview cache and warmup settings
    #[serde(default)]
    pub preview: PreviewConfig,

    /// Published worker dispatch settings
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the router listens on
    pub listen: String,

    /// Largest inbound body buffered for proxying or deploys
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudflareConfig {
    /// Cloudflare Account ID
    pub account_id: Option<String>,

    /// API token with Workers Scripts edit permission
    pub api_token: Option<String>,

    /// API base URL (override for testing)
    pub api_base: Option<String>,

    /// Dispatch namespace that published workers are uploaded into
    pub dispatch_namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Control plane API URL
    pub api_url: Option<String>,

    /// Control plane API key (sent as a bearer token)
    pub api_key: Option<String>,

    /// Port used when the preview host does not encode one
    pub default_port: u16,

    /// Header carrying the preview token to the sandbox upstream
    pub token_header: String,

    /// Start stopped sandboxes before resolving their preview URL
    pub wake_stopped: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            default_port: DEFAULT_SANDBOX_PORT,
            token_header: DEFAULT_TOKEN_HEADER.to_string(),
            wake_stopped: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// How long a resolved preview URL and token are reused
    pub cache_ttl_secs: u64,

    /// Maximum number of cached sandbox ports
    pub cache_capacity: usize,

    /// Interval of the background expiry sweep
    pub sweep_interval_secs: u64,

    /// Retry 404/5xx upstream responses while the dev server boots
    pub warmup: bool,

    pub warmup_interval_ms: u64,

    pub warmup_deadline_ms: u64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            cache_capacity: 1024,
            sweep_interval_secs: 60,
            warmup: true,
            warmup_interval_ms: 500,
            warmup_deadline_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Domain whose subdomains name published workers (e.g. apps.example.com)
    pub root_domain: Option<String>,

    /// Upstream URL for a worker, `{name}` is replaced with the worker name
    pub upstream_template: Option<String>,

    /// Take the worker name from the first path segment when the host has none
    pub path_fallback: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            root_domain: None,
            upstream_template: None,
            path_fallback: true,
        }
    }
}

impl EdgeConfig {
    /// Get the default config file path
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("sandbox-edge").join("config.toml"))
    }

    /// Load config from the default path, returning defaults if it doesn't exist
    pub fn load() -> Result<Self, ConfigError> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Write a sample config to `path`, or the default location
    pub fn write_sample(
        path: Option<&Path>,
        force: bool,
    ) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path().ok_or("Could not determine config directory")?,
        };
        if path.exists() && !force {
            return Err(format!(
                "Config already exists at {} (use --force to overwrite)",
                path.display()
            )
            .into());
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, sample_config())?;
        Ok(path)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .listen
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                key: "server.listen",
                message: e.to_string(),
            })
    }

    /// Get effective API base (config -> default)
    pub fn api_base(&self) -> String {
        self.cloudflare
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string()
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.preview.cache_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.preview.sweep_interval_secs.max(1))
    }

    pub fn warmup_interval(&self) -> Duration {
        Duration::from_millis(self.preview.warmup_interval_ms)
    }

    pub fn warmup_deadline(&self) -> Duration {
        Duration::from_millis(self.preview.warmup_deadline_ms)
    }
}

/// Account credentials for the deployment platform.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub account_id: String,
    pub api_token: String,
}

impl Credentials {
    /// Pick explicit values first, then the configured ones.
    pub fn resolve(
        config: &CloudflareConfig,
        account_id: Option<&str>,
        api_token: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let account_id = non_empty(account_id)
            .or_else(|| non_empty(config.account_id.as_deref()))
            .ok_or(ConfigError::Missing("cloudflare.account_id"))?;
        let api_token = non_empty(api_token)
            .or_else(|| non_empty(config.api_token.as_deref()))
            .ok_or(ConfigError::Missing("cloudflare.api_token"))?;
        Ok(Self {
            account_id,
            api_token,
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Generate a sample config file content
pub fn sample_config() -> &'static str {
    r#"# sandbox-edge configuration
# Location: ~/.config/sandbox-edge/config.toml

[server]
listen = "0.0.0.0:8787"

[cloudflare]
# account_id = "your-account-id"
# api_token = "your-api-token"
# Upload published workers into this dispatch namespace
# dispatch_namespace = "published"

[sandbox]
# Sandbox control plane
# api_url = "https://app.daytona.io/api"
# api_key = "your-api-key"
default_port = 3000
token_header = "x-daytona-preview-token"
wake_stopped = true

[preview]
cache_ttl_secs = 300
cache_capacity = 1024
warmup = true
warmup_interval_ms = 500
warmup_deadline_ms = 15000

[dispatch]
# root_domain = "apps.example.com"
# upstream_template = "https://{name}.example.workers.dev"
path_fallback = true
"#
}
