//! Hook runner: executes a user-supplied command, streams its stdout
//! line-by-line into the inbox and enforces the retry protocol.
//!
//! A hook signals "not done yet, call me again" with exit code 3; the runner
//! waits `retry_interval` between attempts and gives up after `max_retries`
//! spawns. Every attempt receives the timestamp of the first invocation and
//! the current retry counter, so a hook can tell how long the overall
//! operation has been going.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ota_agent_core::config::HooksConfig;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::process::Command;
use tracing::{debug, error, warn};

use crate::cancel::CancelFlag;
use crate::events::{Event, HookEvent, HookStatus, Inbox};

pub const RETRY_EXIT_CODE: i32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_retries: u32,
}

impl From<&HooksConfig> for RetryPolicy {
    fn from(hooks: &HooksConfig) -> Self {
        RetryPolicy {
            interval: hooks.retry_interval,
            max_retries: hooks.max_retries,
        }
    }
}

/// Handle to a running hook. Dropping it does not stop the hook; states keep
/// it around and call [`HookHandle::cancel`] on exit.
#[derive(Debug)]
pub struct HookHandle {
    cancel: Arc<CancelFlag>,
    task: tokio::task::JoinHandle<()>,
}

impl HookHandle {
    /// Stops the runner at its next safe point: between retries, or by
    /// killing the child when it is blocked on output.
    pub fn cancel(&self) {
        self.cancel.set();
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

pub fn run_hook(command: &Path, inbox: Inbox, args: Vec<String>, policy: RetryPolicy) -> HookHandle {
    debug!(command = %command.display(), ?args, "running hook");
    let cancel = Arc::new(CancelFlag::default());
    let task = tokio::spawn(hook_task(
        command.to_path_buf(),
        inbox,
        args,
        policy,
        cancel.clone(),
    ));
    HookHandle { cancel, task }
}

enum Attempt {
    Completed(String),
    Retry,
    Failed(String),
    Cancelled,
}

async fn hook_task(
    command: PathBuf,
    inbox: Inbox,
    args: Vec<String>,
    policy: RetryPolicy,
    cancel: Arc<CancelFlag>,
) {
    // Captured once; retries keep reporting the original start time.
    let first_call = Utc::now().timestamp();
    let mut retry: u32 = 0;

    while retry < policy.max_retries && !cancel.is_set() {
        match run_attempt(&command, &inbox, &args, first_call, retry, &cancel).await {
            Attempt::Completed(last_line) => {
                publish(&inbox, &command, HookStatus::Completed, last_line);
                return;
            }
            Attempt::Failed(message) => {
                error!(command = %command.display(), message, "hook failed");
                publish(&inbox, &command, HookStatus::Failed, message);
                return;
            }
            Attempt::Cancelled => return,
            Attempt::Retry => {
                debug!(command = %command.display(), retry, "hook asked for a retry");
                tokio::select! {
                    _ = tokio::time::sleep(policy.interval) => {}
                    _ = cancel.cancelled() => return,
                }
                retry += 1;
                if retry == policy.max_retries {
                    let total = policy.interval.as_secs() * u64::from(policy.max_retries);
                    warn!(command = %command.display(), "giving up on hook after {total}s");
                    publish(
                        &inbox,
                        &command,
                        HookStatus::TimedOut,
                        format!("Timeout after {total}s"),
                    );
                    return;
                }
            }
        }
    }
}

async fn run_attempt(
    command: &Path,
    inbox: &Inbox,
    args: &[String],
    first_call: i64,
    retry: u32,
    cancel: &CancelFlag,
) -> Attempt {
    let mut child = match Command::new(command)
        .arg(first_call.to_string())
        .arg(retry.to_string())
        .args(args)
        .stdout(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => return Attempt::Failed(format!("Failed to spawn: {err}")),
    };

    let mut last_line = String::new();
    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if !line.is_empty() {
                            last_line = line.to_string();
                            publish(inbox, command, HookStatus::Output, line);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = child.kill().await;
                        return Attempt::Failed(format!("Failed to read output: {err}"));
                    }
                },
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Attempt::Cancelled;
                }
            }
        }
    }

    match child.wait().await {
        Ok(status) => match status.code() {
            Some(0) => Attempt::Completed(last_line),
            Some(RETRY_EXIT_CODE) => Attempt::Retry,
            Some(code) => Attempt::Failed(format!("Exit code: {code}")),
            None => Attempt::Failed("Terminated by signal".to_string()),
        },
        Err(err) => Attempt::Failed(format!("Failed to reap: {err}")),
    }
}

fn publish(inbox: &Inbox, command: &Path, status: HookStatus, message: impl Into<String>) {
    let _ = inbox.send(Event::Hook(HookEvent {
        command: command.to_path_buf(),
        status,
        message: message.into(),
    }));
}
