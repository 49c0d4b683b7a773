// src/config/validate.rs

use std::net::SocketAddr;
use std::time::Duration;

use crate::config::model::{ConfigFile, RawConfigFile, ServiceConfig};
use crate::errors::{Result, TaskforgeError};
use crate::scheduler::{ExecutionPolicy, KindTimeouts, allowlist_regex};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = TaskforgeError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_limits(&raw)?;

        let service = ServiceConfig {
            max_concurrency: raw.service.max_concurrency,
            backlog_limit: raw.service.backlog_limit,
            grace_period: duration_field("service.grace_period", &raw.service.grace_period)?,
            retry_after: duration_field("service.retry_after", &raw.service.retry_after)?,
            max_output_bytes: raw.service.max_output_bytes,
            max_page_size: raw.service.max_page_size,
        };
        let timeouts = KindTimeouts {
            url_download: timeout_field("timeouts.url_download", &raw.timeouts.url_download)?,
            bulk_scrape: timeout_field("timeouts.bulk_scrape", &raw.timeouts.bulk_scrape)?,
            shell_command: timeout_field("timeouts.shell_command", &raw.timeouts.shell_command)?,
        };
        let bind: SocketAddr = raw.server.bind.trim().parse().map_err(|e| {
            config_error(format!("[server].bind '{}' is not a socket address: {e}", raw.server.bind))
        })?;
        let policy = build_policy(&raw)?;

        if raw.store.root.as_os_str().is_empty() {
            return Err(config_error("[store].root must not be empty"));
        }
        if raw.download.user_agent.trim().is_empty() {
            return Err(config_error("[download].user_agent must not be empty"));
        }

        Ok(ConfigFile {
            service,
            timeouts,
            store: raw.store,
            bind,
            download: raw.download,
            policy,
        })
    }
}

fn config_error(msg: impl Into<String>) -> TaskforgeError {
    TaskforgeError::ConfigError(msg.into())
}

fn validate_limits(cfg: &RawConfigFile) -> Result<()> {
    let checks = [
        ("[service].max_concurrency", cfg.service.max_concurrency),
        ("[service].backlog_limit", cfg.service.backlog_limit),
        ("[service].max_output_bytes", cfg.service.max_output_bytes),
        ("[service].max_page_size", cfg.service.max_page_size),
        ("[download].max_targets", cfg.download.max_targets),
        ("[download].max_pages", cfg.download.max_pages),
        ("[download].scrape_parallelism", cfg.download.scrape_parallelism),
    ];
    for (name, value) in checks {
        if value == 0 {
            return Err(config_error(format!("{name} must be >= 1 (got 0)")));
        }
    }
    if cfg.download.max_download_bytes == Some(0) {
        return Err(config_error("[download].max_download_bytes must be >= 1 when set"));
    }
    Ok(())
}

fn duration_field(name: &str, raw: &str) -> Result<Duration> {
    parse_duration(raw).map_err(|e| config_error(format!("{name}: {e}")))
}

fn timeout_field(name: &str, raw: &str) -> Result<Duration> {
    let d = duration_field(name, raw)?;
    if d.is_zero() {
        return Err(config_error(format!("{name} must be greater than zero")));
    }
    Ok(d)
}

fn build_policy(cfg: &RawConfigFile) -> Result<ExecutionPolicy> {
    let command_allowlist = cfg
        .policy
        .command_allowlist
        .iter()
        .map(|pattern| {
            allowlist_regex(pattern).map_err(|e| {
                config_error(format!("[policy].command_allowlist: invalid regex '{pattern}': {e}"))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    for dir in &cfg.policy.allowed_working_dirs {
        if !dir.is_absolute() {
            return Err(config_error(format!(
                "[policy].allowed_working_dirs entries must be absolute (got '{}')",
                dir.display()
            )));
        }
    }

    Ok(ExecutionPolicy {
        allow_shell: cfg.policy.allow_shell,
        command_allowlist,
        allowed_working_dirs: cfg.policy.allowed_working_dirs.clone(),
    })
}

/// Parse durations like `"250ms"`, `"3s"`, `"1m"`, `"2h"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{s}' is missing a unit suffix"))?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{num_part}': {e}"))?;

    match unit_part.trim().to_lowercase().as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        unit => Err(format!(
            "unsupported duration unit '{unit}'; expected ms, s, m, or h"
        )),
    }
}
