use crate::services::transfer_service::{QuotaPolicy, TransferSettings};
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Per-file backend calls in flight across all transfers.
    pub transfer_concurrency: usize,
    pub enforce_transfer_quota: bool,
    /// Quota of owners without an explicit limit.
    pub default_quota_bytes: i64,
    pub max_permission_depth: usize,
    /// Users registered in the local directory at startup.
    pub bootstrap_users: Vec<String>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "File gateway: resumable uploads and cross-owner transfers")]
pub struct Args {
    /// Host to bind to (overrides GATEWAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides GATEWAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides GATEWAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides GATEWAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Transfer fan-out bound (overrides GATEWAY_TRANSFER_CONCURRENCY)
    #[arg(long)]
    pub transfer_concurrency: Option<usize>,

    /// Refuse transfers exceeding the destination quota (overrides GATEWAY_ENFORCE_TRANSFER_QUOTA)
    #[arg(long)]
    pub enforce_transfer_quota: Option<bool>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("GATEWAY_PORT", 3000u16)?;
        let env_storage =
            env::var("GATEWAY_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("GATEWAY_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/gateway.db".into());
        let env_concurrency = env_or("GATEWAY_TRANSFER_CONCURRENCY", 16usize)?;
        let env_enforce = env_or("GATEWAY_ENFORCE_TRANSFER_QUOTA", true)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            transfer_concurrency: args.transfer_concurrency.unwrap_or(env_concurrency),
            enforce_transfer_quota: args.enforce_transfer_quota.unwrap_or(env_enforce),
            default_quota_bytes: env_or("GATEWAY_DEFAULT_QUOTA_BYTES", 15 * 1024 * 1024 * 1024)?,
            max_permission_depth: env_or("GATEWAY_MAX_PERMISSION_DEPTH", 64usize)?,
            bootstrap_users: env::var("GATEWAY_BOOTSTRAP_USERS")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            concurrency: self.transfer_concurrency,
            quota_policy: if self.enforce_transfer_quota {
                QuotaPolicy::Enforce
            } else {
                QuotaPolicy::ReportOnly
            },
        }
    }
}

/// Read and parse `name`, or `default` when it is unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
