use ota_agent_core::jobs::{Job, JobFailedStatus, JobProgressStatus, JobSuccessStatus};
use tracing::{error, info};

use crate::events::{Event, HookStatus};
use crate::hooks::{HookHandle, run_hook};
use crate::machine::Context;
use crate::states::JobState;

/// Runs the restart hook. The `reboot_start` marker published before the
/// hook is what `verify_job` keys on after a real reboot; a hook that
/// returns instead of rebooting counts as a soft restart.
pub(crate) struct RestartState {
    job: Job,
    restart_hook: Option<HookHandle>,
}

impl RestartState {
    pub(crate) fn new(job: Job) -> Self {
        RestartState {
            job,
            restart_hook: None,
        }
    }

    fn stop_hooks(&mut self) {
        if let Some(hook) = &self.restart_hook {
            hook.cancel();
        }
    }
}

impl JobState for RestartState {
    fn job(&self) -> &Job {
        &self.job
    }

    fn on_enter(&mut self, ctx: &Context) {
        match &ctx.cfg.hooks.restart {
            Some(restart_hook) => {
                info!("initiating restart");
                ctx.job_progress(&self.job, JobProgressStatus::RebootStart, None);
                let force = if self.job.force { "true" } else { "" };
                self.restart_hook = Some(run_hook(
                    restart_hook,
                    ctx.inbox.clone(),
                    vec![self.job.meta_arg(), force.to_string()],
                    ctx.retry_policy(),
                ));
            }
            None => {
                info!("no restart hook provided");
                ctx.job_succeeded(&self.job, JobSuccessStatus::NoRestartHookProvided, None);
                ctx.publish_event(Event::RestartInterrupted);
            }
        }
    }

    fn on_exit(&mut self, _ctx: &Context) {
        self.stop_hooks();
    }

    fn on_job_cancelled(&mut self, ctx: &Context) {
        self.stop_hooks();
        ctx.publish_event(Event::RestartInterrupted);
    }

    fn handle(&mut self, ctx: &Context, event: &Event) {
        let Event::Hook(hook) = event else {
            return;
        };
        if ctx.cfg.hooks.restart.as_deref() != Some(hook.command.as_path()) {
            return;
        }

        match hook.status {
            HookStatus::Completed => {
                info!("restart hook done");
                ctx.job_succeeded(&self.job, JobSuccessStatus::CompleteSoftRestart, None);
                ctx.publish_event(Event::RestartInterrupted);
            }
            HookStatus::Output => {}
            HookStatus::Failed | HookStatus::TimedOut => {
                error!(message = %hook.message, "restart failed");
                ctx.job_failed(
                    &self.job,
                    JobFailedStatus::RestartHookFailed,
                    Some(&hook.message),
                );
                ctx.publish_event(Event::RestartInterrupted);
            }
        }
    }
}
