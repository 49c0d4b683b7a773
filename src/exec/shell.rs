// src/exec/shell.rs

//! Shell command runner.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::store::{ArtifactWriter, PutMode};
use crate::task::{FailureReason, Progress, ProgressUnit, ShellCommandParams, TaskError};

use super::backend::{Interrupt, RunContext, RunOutcome};

/// Name of the artifact holding the full captured log.
pub const OUTPUT_LOG: &str = "output.log";

/// How long to wait for the output pipes to drain once the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run `sh -c <command>`, streaming its output into the task record.
///
/// A non-zero exit status is a normal completion with that exit code.
pub async fn run_shell(ctx: &RunContext, params: &ShellCommandParams) -> RunOutcome {
    match run_shell_inner(ctx, params).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(task_id = %ctx.task_id, error = %err, "shell runner error");
            RunOutcome::Failed(TaskError::new(FailureReason::Internal, format!("{err:#}")))
        }
    }
}

async fn run_shell_inner(ctx: &RunContext, params: &ShellCommandParams) -> Result<RunOutcome> {
    info!(
        task_id = %ctx.task_id,
        cmd = %params.command,
        working_dir = ?params.working_dir,
        "starting shell command"
    );

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&params.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(ref dir) = params.working_dir {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return Ok(RunOutcome::Failed(spawn_error(&e, params))),
    };
    // The child leads its own process group; the id is gone once it is reaped.
    let pgid = child.id();

    let log = ctx
        .store
        .create(&ctx.task_id, OUTPUT_LOG, PutMode::Replace)
        .await
        .context("opening output log artifact")?;
    let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, "", line_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, "[stderr] ", line_tx.clone());
    }
    drop(line_tx);
    let collector = spawn_collector(ctx.clone(), line_rx, log);

    tokio::select! {
        status = child.wait() => {
            let status = status.context("waiting for shell process")?;
            let exit_code = exit_code(status);
            info!(task_id = %ctx.task_id, exit_code, success = status.success(), "shell process exited");

            // Background jobs must not outlive the task or hold the pipes open.
            if let Some(pgid) = pgid {
                release_group(pgid, ctx.grace_period).await;
            }

            let log = match tokio::time::timeout(DRAIN_TIMEOUT, collector).await {
                Ok(joined) => joined.context("output collector panicked")??,
                Err(_) => {
                    warn!(task_id = %ctx.task_id, "output pipes still open after exit; log may be incomplete");
                    return Ok(RunOutcome::completed(Some(exit_code), Vec::new()));
                }
            };
            let artifact = log.finish().await.context("storing output log")?;
            Ok(RunOutcome::completed(Some(exit_code), vec![artifact]))
        }

        interrupt = ctx.interrupted() => {
            terminate(&mut child, pgid, ctx.grace_period).await;
            collector.abort();

            match interrupt {
                Interrupt::Cancelled => {
                    info!(task_id = %ctx.task_id, "shell command cancelled; process reaped");
                    Ok(RunOutcome::Cancelled)
                }
                Interrupt::TimedOut => {
                    warn!(task_id = %ctx.task_id, timeout = ?ctx.timeout, "shell command timed out");
                    Ok(RunOutcome::Failed(TaskError::new(
                        FailureReason::Timeout,
                        format!("command exceeded its timeout of {:?}", ctx.timeout),
                    )))
                }
            }
        }
    }
}

fn spawn_error(e: &io::Error, params: &ShellCommandParams) -> TaskError {
    let reason = if e.kind() == io::ErrorKind::PermissionDenied {
        FailureReason::PermissionDenied
    } else {
        FailureReason::SpawnFailed
    };
    let location = params
        .working_dir
        .as_deref()
        .map(|d| format!(" in '{d}'"))
        .unwrap_or_default();
    TaskError::new(reason, format!("could not start command{location}: {e}"))
}

fn spawn_reader<R>(reader: R, prefix: &'static str, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(format!("{prefix}{line}")).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "output pipe read failed");
                    break;
                }
            }
        }
    });
}

/// Forward captured lines into the task record and the log artifact.
/// Resolves once every pipe reached EOF.
fn spawn_collector(
    ctx: RunContext,
    mut rx: mpsc::UnboundedReceiver<String>,
    mut log: ArtifactWriter,
) -> JoinHandle<Result<ArtifactWriter>> {
    tokio::spawn(async move {
        let mut count: u64 = 0;
        while let Some(line) = rx.recv().await {
            ctx.sink.line(&line);
            log.write(line.as_bytes()).await?;
            log.write(b"\n").await?;
            count += 1;
            ctx.sink.progress(Progress::new(ProgressUnit::Lines, count, None));
        }
        Ok(log)
    })
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Ask the process group to stop, force-kill it after `grace`, then reap.
async fn terminate(child: &mut Child, pgid: Option<u32>, grace: Duration) {
    let Some(pgid) = pgid else {
        // Already reaped.
        return;
    };

    let deadline = Instant::now() + grace;
    signal_group(pgid, Signal::Term);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!(pid = pgid, "process exited after SIGTERM"),
        Err(_) => warn!(pid = pgid, grace = ?grace, "process ignored SIGTERM; sending SIGKILL"),
    }
    if group_alive_until(pgid, deadline).await {
        signal_group(pgid, Signal::Kill);
    }
    if let Err(e) = child.wait().await {
        debug!(pid = pgid, error = %e, "reaping after SIGKILL failed");
    }
}

/// Stop whatever is left of the group after its leader exited on its own.
async fn release_group(pgid: u32, grace: Duration) {
    if !group_alive(pgid) {
        return;
    }
    debug!(pid = pgid, "background processes outlived the shell; terminating group");
    signal_group(pgid, Signal::Term);
    if group_alive_until(pgid, Instant::now() + grace).await {
        warn!(pid = pgid, grace = ?grace, "process group ignored SIGTERM; sending SIGKILL");
        signal_group(pgid, Signal::Kill);
    }
}

/// Poll the group until it is gone or `deadline` passes. True if it is still alive.
async fn group_alive_until(pgid: u32, deadline: Instant) -> bool {
    const POLL: Duration = Duration::from_millis(20);
    while group_alive(pgid) {
        if Instant::now() >= deadline {
            return true;
        }
        tokio::time::sleep(POLL).await;
    }
    false
}

#[cfg(unix)]
fn group_alive(pgid: u32) -> bool {
    // Signal 0 only checks that some member of the group still exists.
    unsafe { libc::killpg(pgid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn group_alive(_pgid: u32) -> bool {
    false
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The child was spawned as the leader of its own process group.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, sig) };
    if rc != 0 {
        debug!(pid, ?signal, error = %io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) {}
