use ota_agent_core::jobs::{
    Job, JobFailedStatus, JobProgressStatus, JobStatus, JobSuccessStatus,
};
use tracing::{debug, error, info};

use crate::events::{Event, HookStatus};
use crate::hooks::{HookHandle, run_hook};
use crate::machine::Context;
use crate::states::JobState;

/// Decides what to do with the selected job: run it, resume it after a
/// reboot, or drop it because the device already has the target version.
pub(crate) struct VerifyJobState {
    job: Job,
    version_hook: Option<HookHandle>,
}

impl VerifyJobState {
    pub(crate) fn new(job: Job) -> Self {
        VerifyJobState {
            job,
            version_hook: None,
        }
    }

    fn job_verified(&self, ctx: &Context) {
        ctx.publish_event(Event::JobVerified {
            job: self.job.clone(),
        });
    }

    fn stop_hooks(&mut self) {
        if let Some(hook) = &self.version_hook {
            hook.cancel();
        }
    }
}

impl JobState for VerifyJobState {
    fn job(&self) -> &Job {
        &self.job
    }

    fn on_enter(&mut self, ctx: &Context) {
        match self.job.status {
            JobStatus::Queued => match &ctx.cfg.hooks.version {
                Some(version_hook) if !self.job.force => {
                    debug!("starting version check");
                    self.version_hook = Some(run_hook(
                        version_hook,
                        ctx.inbox.clone(),
                        vec![self.job.meta_arg()],
                        ctx.retry_policy(),
                    ));
                }
                _ => {
                    info!(force = self.job.force, "skipping version check");
                    self.job_verified(ctx);
                }
            },
            JobStatus::InProgress => {
                // A recorded reboot marker means we came back from the
                // restart hook; only the post-install checks are left.
                if self.job.internal_state() == Some(JobProgressStatus::RebootStart.as_str()) {
                    info!("installation done");
                    ctx.publish_event(Event::JobInstallationDone {
                        job: self.job.clone(),
                    });
                } else {
                    info!("redoing job process");
                    self.job_verified(ctx);
                }
            }
            other => {
                error!(status = ?other, "unexpected job status, dropping job");
                ctx.publish_event(Event::JobRevoked);
            }
        }
    }

    fn on_exit(&mut self, _ctx: &Context) {
        self.stop_hooks();
    }

    fn on_job_cancelled(&mut self, ctx: &Context) {
        self.stop_hooks();
        ctx.publish_event(Event::JobRevoked);
    }

    fn handle(&mut self, ctx: &Context, event: &Event) {
        let Event::Hook(hook) = event else {
            return;
        };
        if ctx.cfg.hooks.version.as_deref() != Some(hook.command.as_path()) {
            return;
        }

        match hook.status {
            HookStatus::Completed => {
                let version = &hook.message;
                if &self.job.version == version {
                    info!(version = %self.job.version, "version is already installed");
                    ctx.job_succeeded(&self.job, JobSuccessStatus::VersionAlreadyInstalled, None);
                    ctx.publish_event(Event::JobRevoked);
                } else {
                    info!(current = %version, target = %self.job.version, "installing new version");
                    self.job_verified(ctx);
                }
            }
            HookStatus::Output => {}
            HookStatus::Failed | HookStatus::TimedOut => {
                error!(message = %hook.message, "version hook failed");
                ctx.job_failed(
                    &self.job,
                    JobFailedStatus::VersionHookFailed,
                    Some(&hook.message),
                );
                ctx.publish_event(Event::JobRevoked);
            }
        }
    }
}
