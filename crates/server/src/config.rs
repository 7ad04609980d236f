//! Command-line and environment configuration.
//!
//! Every flag can also be supplied through its env var so the gateway can be
//! configured entirely from a pod manifest.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};

use crate::storage::StoreConfig;
use crate::workspace::ResolutionMode;

#[derive(Debug, Parser)]
#[command(name = "replhost", version, about = "Remote workspace session gateway")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "REPLHOST_BIND", default_value = "0.0.0.0:3000")]
    pub bind: String,

    /// Directory holding the local workspace caches
    #[arg(long, env = "REPLHOST_CACHE_ROOT")]
    pub cache_root: Option<PathBuf>,

    /// How a connection's workspace is identified
    #[arg(
        long,
        env = "REPLHOST_WORKSPACE_RESOLUTION",
        value_enum,
        default_value_t = ResolutionArg::Query
    )]
    pub workspace_resolution: ResolutionArg,

    /// HMAC secret used to verify session credentials
    #[arg(long, env = "REPLHOST_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    /// Object storage backend
    #[arg(long, env = "REPLHOST_STORAGE", value_enum, default_value_t = StorageArg::S3)]
    pub storage: StorageArg,

    #[arg(long, env = "S3_BUCKET")]
    pub s3_bucket: Option<String>,

    #[arg(long, env = "AWS_REGION")]
    pub s3_region: Option<String>,

    /// Custom endpoint for S3-compatible stores
    #[arg(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// Leading key segment for workspace objects
    #[arg(long, env = "REPLHOST_STORAGE_CLASS", default_value = "code")]
    pub storage_class: String,

    /// Leading key segment for provisioning templates
    #[arg(long, env = "REPLHOST_TEMPLATE_CLASS", default_value = "base")]
    pub template_class: String,

    #[arg(long, env = "REPLHOST_LIST_PAGE_SIZE", default_value_t = 1000)]
    pub list_page_size: usize,

    /// Upper bound on hydration and on each remote push
    #[arg(long, env = "REPLHOST_STORE_TIMEOUT_SECS", default_value_t = 60)]
    pub store_timeout_secs: u64,

    /// Base URL of the compute orchestrator; teardown is skipped when unset
    #[arg(long, env = "REPLHOST_COMPUTE_URL")]
    pub compute_url: Option<String>,

    /// Shell spawned for terminal sessions
    #[arg(long, env = "REPLHOST_SHELL", default_value = "bash")]
    pub shell: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResolutionArg {
    Query,
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageArg {
    S3,
    Memory,
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub cache_root: PathBuf,
    pub resolution: ResolutionMode,
    pub jwt_secret: String,
    pub store: StoreConfig,
    pub storage_class: String,
    pub template_class: String,
    pub list_page_size: usize,
    pub store_timeout: Duration,
    pub compute_url: Option<String>,
    pub shell: String,
}

impl Config {
    pub fn from_args(args: Args) -> anyhow::Result<Self> {
        let bind: SocketAddr = args
            .bind
            .parse()
            .with_context(|| format!("invalid bind address {:?}", args.bind))?;

        if args.jwt_secret.trim().is_empty() {
            bail!("jwt secret must not be empty");
        }
        if args.list_page_size == 0 {
            bail!("list page size must be at least 1");
        }

        let store = match args.storage {
            StorageArg::Memory => StoreConfig::Memory,
            StorageArg::S3 => StoreConfig::S3 {
                bucket: args
                    .s3_bucket
                    .filter(|b| !b.is_empty())
                    .context("S3 storage requires --s3-bucket / S3_BUCKET")?,
                region: args.s3_region,
                endpoint: args.s3_endpoint,
            },
        };

        let resolution = match args.workspace_resolution {
            ResolutionArg::Query => ResolutionMode::Query,
            ResolutionArg::Host => ResolutionMode::Host,
        };

        Ok(Self {
            bind,
            cache_root: args.cache_root.unwrap_or_else(default_cache_root),
            resolution,
            jwt_secret: args.jwt_secret,
            store,
            storage_class: trim_slashes(&args.storage_class),
            template_class: trim_slashes(&args.template_class),
            list_page_size: args.list_page_size,
            store_timeout: Duration::from_secs(args.store_timeout_secs.max(1)),
            compute_url: args
                .compute_url
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
            shell: args.shell,
        })
    }
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("replhost")
        .join("workspaces")
}

fn trim_slashes(value: &str) -> String {
    value.trim_matches('/').to_string()
}
