// src/config/model.rs

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::exec::ExecSettings;
use crate::registry::RegistryOptions;
use crate::scheduler::{DispatchOptions, ExecutionPolicy, KindTimeouts};
use crate::task::ParameterLimits;

/// Configuration exactly as read from TOML, before validation.
///
/// ```toml
/// [service]
/// max_concurrency = 4
/// backlog_limit = 64
/// grace_period = "5s"
///
/// [timeouts]
/// shell_command = "10m"
///
/// [store]
/// root = "./taskforge-data/artifacts"
/// journal = "./taskforge-data/journal.jsonl"
///
/// [server]
/// bind = "127.0.0.1:8001"
///
/// [policy]
/// allow_shell = true
/// command_allowlist = ["echo [a-z ]+", "ls( -l)?"]
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub download: DownloadSection,
    #[serde(default)]
    pub policy: PolicySection,
}

/// `[service]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSection {
    /// Size of the worker pool.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Pending tasks held before submissions are refused.
    #[serde(default = "default_backlog_limit")]
    pub backlog_limit: usize,

    /// Delay between SIGTERM and SIGKILL for a cancelled command.
    #[serde(default = "default_grace_period")]
    pub grace_period: String,

    /// `Retry-After` hint sent with 503 responses.
    #[serde(default = "default_retry_after")]
    pub retry_after: String,

    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_backlog_limit() -> usize {
    64
}

fn default_grace_period() -> String {
    "5s".to_string()
}

fn default_retry_after() -> String {
    "2s".to_string()
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_max_page_size() -> usize {
    200
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            backlog_limit: default_backlog_limit(),
            grace_period: default_grace_period(),
            retry_after: default_retry_after(),
            max_output_bytes: default_max_output_bytes(),
            max_page_size: default_max_page_size(),
        }
    }
}

/// `[timeouts]` section: wall-clock limit per task kind.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_url_download_timeout")]
    pub url_download: String,
    #[serde(default = "default_bulk_scrape_timeout")]
    pub bulk_scrape: String,
    #[serde(default = "default_shell_command_timeout")]
    pub shell_command: String,
}

fn default_url_download_timeout() -> String {
    "30m".to_string()
}

fn default_bulk_scrape_timeout() -> String {
    "2h".to_string()
}

fn default_shell_command_timeout() -> String {
    "10m".to_string()
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            url_download: default_url_download_timeout(),
            bulk_scrape: default_bulk_scrape_timeout(),
            shell_command: default_shell_command_timeout(),
        }
    }
}

/// `[store]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_store_root")]
    pub root: PathBuf,

    /// Task journal. Without it the registry lives in memory only.
    #[serde(default)]
    pub journal: Option<PathBuf>,
}

fn default_store_root() -> PathBuf {
    PathBuf::from("./taskforge-data/artifacts")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            root: default_store_root(),
            journal: None,
        }
    }
}

/// `[server]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8001".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// `[download]` section, shared by downloads and scrapes.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadSection {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Hard cap on a single transfer; unlimited when absent.
    #[serde(default)]
    pub max_download_bytes: Option<u64>,

    #[serde(default = "default_max_targets")]
    pub max_targets: usize,

    /// Most pages a scrape may visit while discovering media.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    /// Upper bound for a scrape's requested parallelism.
    #[serde(default = "default_scrape_parallelism")]
    pub scrape_parallelism: usize,
}

fn default_user_agent() -> String {
    concat!("taskforge/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_max_targets() -> usize {
    500
}

fn default_max_pages() -> usize {
    50
}

fn default_scrape_parallelism() -> usize {
    4
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            max_download_bytes: None,
            max_targets: default_max_targets(),
            max_pages: default_max_pages(),
            scrape_parallelism: default_scrape_parallelism(),
        }
    }
}

/// `[policy]` section. Shell execution is off unless `allow_shell = true`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicySection {
    #[serde(default)]
    pub allow_shell: bool,

    /// Regexes; when non-empty a command must match at least one in full
    /// and may not contain shell control syntax.
    #[serde(default)]
    pub command_allowlist: Vec<String>,

    /// Absolute directory prefixes allowed as `working_dir`.
    #[serde(default)]
    pub allowed_working_dirs: Vec<PathBuf>,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<String>,
    pub max_concurrency: Option<usize>,
    pub store_root: Option<PathBuf>,
}

impl RawConfigFile {
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref bind) = overrides.bind {
            self.server.bind = bind.clone();
        }
        if let Some(n) = overrides.max_concurrency {
            self.service.max_concurrency = n;
        }
        if let Some(ref root) = overrides.store_root {
            self.store.root = root.clone();
        }
    }
}

/// Validated configuration.
///
/// Only constructed through `TryFrom<RawConfigFile>` (see `validate.rs`).
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub service: ServiceConfig,
    pub timeouts: KindTimeouts,
    pub store: StoreSection,
    pub bind: SocketAddr,
    pub download: DownloadSection,
    pub policy: ExecutionPolicy,
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceConfig {
    pub max_concurrency: usize,
    pub backlog_limit: usize,
    pub grace_period: Duration,
    pub retry_after: Duration,
    pub max_output_bytes: usize,
    pub max_page_size: usize,
}

impl ConfigFile {
    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            max_concurrency: self.service.max_concurrency,
            backlog_limit: self.service.backlog_limit,
            retry_after: self.service.retry_after,
            grace_period: self.service.grace_period,
            timeouts: self.timeouts,
        }
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            max_output_bytes: self.service.max_output_bytes,
            max_page_size: self.service.max_page_size,
            limits: ParameterLimits {
                max_targets: self.download.max_targets,
                max_pages: self.download.max_pages,
            },
        }
    }

    pub fn exec_settings(&self) -> ExecSettings {
        ExecSettings {
            user_agent: self.download.user_agent.clone(),
            max_download_bytes: self.download.max_download_bytes,
            scrape_parallelism: self.download.scrape_parallelism,
            max_targets: self.download.max_targets,
            max_pages: self.download.max_pages,
        }
    }
}
