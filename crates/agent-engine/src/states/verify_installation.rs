use ota_agent_core::jobs::{Job, JobFailedStatus, JobSuccessStatus};
use tracing::{debug, error, info};

use crate::events::{Event, HookStatus};
use crate::hooks::{HookHandle, run_hook};
use crate::machine::Context;
use crate::states::JobState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Version,
    Ready,
}

/// Post-install checks: the version hook must report the job's target
/// version, then the ready hook (when configured) must confirm the device is
/// operational.
pub(crate) struct VerifyInstallationState {
    job: Job,
    phase: Phase,
    version_hook: Option<HookHandle>,
    ready_hook: Option<HookHandle>,
}

impl VerifyInstallationState {
    pub(crate) fn new(job: Job) -> Self {
        VerifyInstallationState {
            job,
            phase: Phase::Version,
            version_hook: None,
            ready_hook: None,
        }
    }

    fn complete(&self, ctx: &Context) {
        ctx.publish_event(Event::JobInstallationComplete);
    }

    fn stop_hooks(&mut self) {
        if let Some(hook) = &self.version_hook {
            hook.cancel();
        }
        if let Some(hook) = &self.ready_hook {
            hook.cancel();
        }
    }

    fn on_version_result(&mut self, ctx: &Context, status: HookStatus, message: &str) {
        match status {
            HookStatus::Completed => {
                if self.job.version == message {
                    match &ctx.cfg.hooks.ready {
                        Some(ready_hook) => {
                            debug!("starting ready check");
                            self.phase = Phase::Ready;
                            self.ready_hook = Some(run_hook(
                                ready_hook,
                                ctx.inbox.clone(),
                                vec![self.job.meta_arg()],
                                ctx.retry_policy(),
                            ));
                        }
                        None => {
                            ctx.job_succeeded(
                                &self.job,
                                JobSuccessStatus::CompleteNoReadyCheck,
                                None,
                            );
                            self.complete(ctx);
                        }
                    }
                } else {
                    let mismatch =
                        format!("expected version {}, found {}", self.job.version, message);
                    error!("{mismatch}");
                    ctx.job_failed(&self.job, JobFailedStatus::VersionMismatch, Some(&mismatch));
                    self.complete(ctx);
                }
            }
            HookStatus::Output => {}
            HookStatus::Failed | HookStatus::TimedOut => {
                error!(%message, "version hook failed");
                ctx.job_failed(&self.job, JobFailedStatus::VersionHookFailed, Some(message));
                self.complete(ctx);
            }
        }
    }

    fn on_ready_result(&mut self, ctx: &Context, status: HookStatus, message: &str) {
        match status {
            HookStatus::Completed => {
                info!("device is ready");
                ctx.job_succeeded(&self.job, JobSuccessStatus::CompleteReady, None);
                self.complete(ctx);
            }
            HookStatus::Output => {}
            HookStatus::Failed | HookStatus::TimedOut => {
                error!(%message, "ready hook failed");
                ctx.job_failed(&self.job, JobFailedStatus::ReadyHookFailed, Some(message));
                self.complete(ctx);
            }
        }
    }
}

impl JobState for VerifyInstallationState {
    fn job(&self) -> &Job {
        &self.job
    }

    fn on_enter(&mut self, ctx: &Context) {
        match &ctx.cfg.hooks.version {
            Some(version_hook) if !self.job.force => {
                debug!("verifying installed version");
                self.version_hook = Some(run_hook(
                    version_hook,
                    ctx.inbox.clone(),
                    vec![self.job.meta_arg()],
                    ctx.retry_policy(),
                ));
            }
            _ => {
                info!(force = self.job.force, "skipping post-install version check");
                ctx.job_succeeded(&self.job, JobSuccessStatus::CompleteNoVersionCheck, None);
                self.complete(ctx);
            }
        }
    }

    fn on_exit(&mut self, _ctx: &Context) {
        self.stop_hooks();
    }

    fn on_job_cancelled(&mut self, ctx: &Context) {
        self.stop_hooks();
        self.complete(ctx);
    }

    fn handle(&mut self, ctx: &Context, event: &Event) {
        let Event::Hook(hook) = event else {
            return;
        };
        let command = Some(hook.command.as_path());

        match self.phase {
            Phase::Version if ctx.cfg.hooks.version.as_deref() == command => {
                self.on_version_result(ctx, hook.status, &hook.message);
            }
            Phase::Ready if ctx.cfg.hooks.ready.as_deref() == command => {
                self.on_ready_result(ctx, hook.status, &hook.message);
            }
            _ => {}
        }
    }
}
