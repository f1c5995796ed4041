use clap::{Parser, Subcommand};
use sandbox_edge::config::{Credentials, EdgeConfig};
use sandbox_edge::deploy::{load_project, run_deploy, DeployConfig};
use sandbox_edge::manifest::build_manifest;
use sandbox_edge::preview::{HttpControlPlane, PreviewCache, PreviewResolver};
use sandbox_edge::router::run_server;
use sandbox_edge::telemetry::{init_tracing, LogFormat};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "sandbox-edge",
    version,
    about = "Edge router for sandbox previews and published workers"
)]
struct Cli {
    /// Config file (default: ~/.config/sandbox-edge/config.toml)
    #[arg(short, long, env = "SANDBOX_EDGE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a sample config file
    Init {
        /// Overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Run the edge router
    Serve {
        /// Listen address (overrides `server.listen`)
        #[arg(short, long, env = "SANDBOX_EDGE_LISTEN")]
        listen: Option<String>,
    },

    /// Deploy a built project as a worker
    Deploy {
        /// Project directory containing wrangler.json(c) and the built bundle
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Wrangler config path (default: wrangler.jsonc or wrangler.json in DIR)
        #[arg(long)]
        wrangler: Option<PathBuf>,

        /// Extra ES module to upload alongside the main bundle (repeatable)
        #[arg(short = 'm', long = "module")]
        modules: Vec<PathBuf>,

        /// Dispatch namespace (falls back to config `cloudflare.dispatch_namespace`)
        #[arg(long)]
        namespace: Option<String>,

        /// Cloudflare account ID (falls back to config `cloudflare.account_id`)
        #[arg(long, env = "CLOUDFLARE_ACCOUNT_ID")]
        account_id: Option<String>,

        /// Cloudflare API token (falls back to config `cloudflare.api_token`)
        #[arg(long, env = "CLOUDFLARE_API_TOKEN")]
        api_token: Option<String>,
    },

    /// Print the asset manifest of a directory as JSON
    Manifest {
        /// Assets directory
        dir: PathBuf,
    },

    /// Resolve a preview host to its upstream through the control plane
    Resolve {
        /// Preview hostname (e.g. 3000-abc123.preview.example.com)
        host: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider BEFORE tokio runtime starts
    // (required for rustls 0.23+ - must happen before any TLS operations)
    #[cfg(feature = "rustls")]
    {
        rustls_crate::crypto::ring::default_provider()
            .install_default()
            .map_err(|_| "Failed to install rustls crypto provider")?;
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    if let Commands::Init { force } = cli.command {
        return run_init(cli.config.as_deref(), force);
    }

    let mut cfg = match cli.config.as_deref() {
        Some(path) => EdgeConfig::load_from(path)?,
        None => EdgeConfig::load()?,
    };

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Serve { listen } => {
            if let Some(listen) = listen {
                cfg.server.listen = listen;
            }
            run_server(cfg).await
        }
        Commands::Deploy {
            dir,
            wrangler,
            modules,
            namespace,
            account_id,
            api_token,
        } => {
            let credentials =
                Credentials::resolve(&cfg.cloudflare, account_id.as_deref(), api_token.as_deref())?;
            let namespace = namespace.or_else(|| cfg.cloudflare.dispatch_namespace.clone());
            run_deploy_command(&cfg, &dir, wrangler.as_deref(), &modules, namespace, credentials)
                .await
        }
        Commands::Manifest { dir } => run_manifest(&dir),
        Commands::Resolve { host } => run_resolve(&cfg, &host).await,
    }
}

fn run_init(path: Option<&Path>, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let target = match path {
        Some(path) => Some(path.to_path_buf()),
        None => EdgeConfig::config_path(),
    };
    let Some(target) = target else {
        return Err("Could not determine config directory".into());
    };

    if target.exists() && !force {
        println!("Config file already exists at: {}", target.display());
        println!("\nUse --force to overwrite, or edit directly:");
        println!("  $EDITOR {}", target.display());
        return Ok(());
    }

    let written = EdgeConfig::write_sample(Some(&target), force)?;
    println!("Created config file: {}", written.display());
    println!("\nEdit it to set the sandbox control plane and Cloudflare credentials:");
    println!("  $EDITOR {}", written.display());
    Ok(())
}

async fn run_deploy_command(
    cfg: &EdgeConfig,
    dir: &Path,
    wrangler: Option<&Path>,
    modules: &[PathBuf],
    namespace: Option<String>,
    credentials: Credentials,
) -> Result<(), Box<dyn std::error::Error>> {
    let project = load_project(dir, wrangler, modules)?;

    println!("Worker: {}", project.wrangler.name);
    if let Some(assets) = project.assets.as_ref() {
        print!("Assets: {} file(s)", assets.manifest.len());
        if assets.skipped > 0 {
            print!(", {} metadata file(s) skipped", assets.skipped);
        }
        println!();
    }

    let deploy = DeployConfig::from_project(project, credentials, namespace)?;
    let outcome = run_deploy(&reqwest::Client::new(), &cfg.api_base(), deploy).await?;

    if outcome.assets_uploaded {
        println!("Assets: {} file(s) synced", outcome.asset_files);
    }
    match outcome.dispatch_namespace.as_deref() {
        Some(ns) => println!("Deployed {} to namespace {}", outcome.script_name, ns),
        None => println!("Deployed {}", outcome.script_name),
    }
    Ok(())
}

fn run_manifest(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let built = build_manifest(dir)?;
    println!("{}", serde_json::to_string_pretty(&built.manifest)?);
    Ok(())
}

async fn run_resolve(cfg: &EdgeConfig, host: &str) -> Result<(), Box<dyn std::error::Error>> {
    let plane = HttpControlPlane::from_config(reqwest::Client::new(), &cfg.sandbox)?;
    let resolver = PreviewResolver::new(
        Arc::new(plane),
        Arc::new(PreviewCache::new(1, cfg.cache_ttl())),
        cfg.sandbox.default_port,
        cfg.sandbox.wake_stopped,
    );

    let resolved = resolver.resolve(host).await?;
    println!("Sandbox: {}", resolved.address.sandbox_id);
    println!("Port:    {}", resolved.address.port);
    println!("URL:     {}", resolved.url);
    println!("Token:   {}", mask_token(&resolved.token));
    Ok(())
}

fn mask_token(token: &str) -> String {
    if token.len() > 8 && token.is_ascii() {
        format!("{}...{}", &token[..4], &token[token.len() - 4..])
    } else {
        "****".to_string()
    }
}
