// src/scheduler/policy.rs

//! Execution policy: which submissions may run at all.
//!
//! Shell execution is off unless explicitly enabled. When enabled, the
//! command must match one of the allowlist regexes in full (if any are
//! configured) and the working directory must sit under one of the allowed
//! prefixes (if any are configured).
//!
//! Commands run through `sh -c`, so with an allowlist in place any shell
//! control syntax (`;`, `&`, `|`, backticks, `$(`, redirections, line
//! breaks) is refused outright. Otherwise `echo hi; rm -rf ~` would pass an
//! `echo .*` entry.

use std::path::{Component, Path, PathBuf};

use regex::Regex;
use tracing::warn;

use crate::errors::{ServiceError, ServiceResult};
use crate::task::TaskParameters;

/// Fragments that let one allowlisted command smuggle in another.
const SHELL_CONTROL: &[&str] = &[";", "&", "|", "`", "$(", ">", "<", "\n", "\r"];

/// Compile an allowlist entry so that it must match the whole command.
pub fn allowlist_regex(pattern: &str) -> Result<Regex, regex::Error> {
    // Reject unbalanced input like `a)|(b` before wrapping it.
    Regex::new(pattern)?;
    Regex::new(&format!("^(?:{pattern})$"))
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionPolicy {
    pub allow_shell: bool,
    pub command_allowlist: Vec<Regex>,
    pub allowed_working_dirs: Vec<PathBuf>,
}

impl ExecutionPolicy {
    /// Policy that lets every well-formed submission through.
    pub fn permissive() -> Self {
        Self {
            allow_shell: true,
            ..Self::default()
        }
    }

    /// Check a submission. Violations are `Forbidden`.
    pub fn check(&self, parameters: &TaskParameters) -> ServiceResult<()> {
        let TaskParameters::ShellCommand(params) = parameters else {
            return Ok(());
        };

        if !self.allow_shell {
            return Err(forbidden("shell execution is disabled on this service"));
        }

        if !self.command_allowlist.is_empty() {
            if let Some(token) = SHELL_CONTROL.iter().find(|t| params.command.contains(**t)) {
                warn!(cmd = %params.command, token = %token.escape_debug(), "command rejected: shell control syntax");
                return Err(forbidden(format!(
                    "command contains '{}', which is not allowed while an allowlist is configured",
                    token.escape_debug()
                )));
            }
            if !self.command_allowlist.iter().any(|re| re.is_match(&params.command)) {
                warn!(cmd = %params.command, "command rejected by allowlist");
                return Err(forbidden("command does not match the configured allowlist"));
            }
        }

        if let Some(ref dir) = params.working_dir {
            self.check_working_dir(Path::new(dir))?;
        }
        Ok(())
    }

    fn check_working_dir(&self, dir: &Path) -> ServiceResult<()> {
        if self.allowed_working_dirs.is_empty() {
            return Ok(());
        }
        if !dir.is_absolute() {
            return Err(forbidden("working_dir must be an absolute path"));
        }
        if dir.components().any(|c| c == Component::ParentDir) {
            return Err(forbidden("working_dir must not contain '..'"));
        }
        if self
            .allowed_working_dirs
            .iter()
            .any(|allowed| dir.starts_with(allowed))
        {
            Ok(())
        } else {
            Err(forbidden(format!(
                "working_dir '{}' is outside the allowed directories",
                dir.display()
            )))
        }
    }
}

fn forbidden(msg: impl Into<String>) -> ServiceError {
    ServiceError::Forbidden(msg.into())
}
