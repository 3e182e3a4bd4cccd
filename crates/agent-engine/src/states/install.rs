use ota_agent_core::jobs::{Job, JobFailedStatus, JobProgressStatus, JobSuccessStatus};
use tracing::{error, info};

use crate::events::{Event, HookStatus};
use crate::hooks::{HookHandle, run_hook};
use crate::machine::Context;
use crate::states::JobState;

/// Runs the install hook against the downloaded artifact, streaming its
/// output as installation progress. Without an install hook the job counts
/// as succeeded, which turns the agent into a plain file-distribution tool.
pub(crate) struct InstallState {
    job: Job,
    install_hook: Option<HookHandle>,
}

impl InstallState {
    pub(crate) fn new(job: Job) -> Self {
        InstallState {
            job,
            install_hook: None,
        }
    }

    fn stop_hooks(&mut self) {
        if let Some(hook) = &self.install_hook {
            hook.cancel();
        }
    }
}

impl JobState for InstallState {
    fn job(&self) -> &Job {
        &self.job
    }

    fn on_enter(&mut self, ctx: &Context) {
        match &ctx.cfg.hooks.install {
            Some(install_hook) => {
                info!("starting installation");
                ctx.job_progress(&self.job, JobProgressStatus::InstallationStart, None);
                let artifact = self
                    .job
                    .artifact_path(&ctx.cfg.service.download_location)
                    .display()
                    .to_string();
                self.install_hook = Some(run_hook(
                    install_hook,
                    ctx.inbox.clone(),
                    vec![self.job.meta_arg(), artifact],
                    ctx.retry_policy(),
                ));
            }
            None => {
                info!("no installation hook provided");
                ctx.job_succeeded(&self.job, JobSuccessStatus::NoInstallationHookProvided, None);
                ctx.publish_event(Event::InstallationInterrupted);
            }
        }
    }

    fn on_exit(&mut self, _ctx: &Context) {
        self.stop_hooks();
    }

    fn on_job_cancelled(&mut self, ctx: &Context) {
        self.stop_hooks();
        ctx.publish_event(Event::InstallationInterrupted);
    }

    fn handle(&mut self, ctx: &Context, event: &Event) {
        let Event::Hook(hook) = event else {
            return;
        };
        if ctx.cfg.hooks.install.as_deref() != Some(hook.command.as_path()) {
            return;
        }

        match hook.status {
            HookStatus::Completed => {
                info!("installation hook done");
                ctx.publish_event(Event::InstallationDone {
                    job: self.job.clone(),
                });
            }
            HookStatus::Output => {
                ctx.job_progress(
                    &self.job,
                    JobProgressStatus::InstallationProgress,
                    Some(&hook.message),
                );
            }
            HookStatus::Failed | HookStatus::TimedOut => {
                error!(message = %hook.message, "installation failed");
                ctx.job_failed(
                    &self.job,
                    JobFailedStatus::InstallationHookFailed,
                    Some(&hook.message),
                );
                ctx.publish_event(Event::InstallationInterrupted);
            }
        }
    }
}
