use std::sync::Arc;

use ota_agent_core::jobs::{Job, JobFailedStatus, JobProgressStatus};
use tracing::{debug, error, warn};

use crate::cancel::CancelFlag;
use crate::download::spawn_download;
use crate::events::{DownloadFailure, Event, HookStatus};
use crate::hooks::{HookHandle, run_hook};
use crate::machine::Context;
use crate::states::JobState;

/// Fetches the artifact: an optional pre-download hook gates the transfer,
/// then the downloader task streams the file while this state forwards its
/// progress to the cloud.
pub(crate) struct DownloadState {
    job: Job,
    download_hook: Option<HookHandle>,
    downloader: Option<Arc<CancelFlag>>,
}

impl DownloadState {
    pub(crate) fn new(job: Job) -> Self {
        DownloadState {
            job,
            download_hook: None,
            downloader: None,
        }
    }

    fn start_download(&mut self, ctx: &Context) {
        ctx.job_progress(&self.job, JobProgressStatus::DownloadStart, None);
        self.downloader = Some(spawn_download(
            self.job.clone(),
            ctx.cfg.service.download_location.clone(),
            ctx.inbox.clone(),
        ));
    }

    fn stop_workers(&mut self) {
        if let Some(hook) = &self.download_hook {
            hook.cancel();
        }
        if let Some(downloader) = &self.downloader {
            downloader.set();
        }
    }
}

impl JobState for DownloadState {
    fn job(&self) -> &Job {
        &self.job
    }

    fn on_enter(&mut self, ctx: &Context) {
        match &ctx.cfg.hooks.download {
            Some(download_hook) if !self.job.force => {
                debug!("running download hook");
                self.download_hook = Some(run_hook(
                    download_hook,
                    ctx.inbox.clone(),
                    vec![self.job.meta_arg()],
                    ctx.retry_policy(),
                ));
            }
            _ => self.start_download(ctx),
        }
    }

    fn on_exit(&mut self, _ctx: &Context) {
        self.stop_workers();
    }

    fn on_job_cancelled(&mut self, ctx: &Context) {
        self.stop_workers();
        ctx.publish_event(Event::DownloadInterrupted);
    }

    fn handle(&mut self, ctx: &Context, event: &Event) {
        match event {
            Event::Hook(hook)
                if ctx.cfg.hooks.download.as_deref() == Some(hook.command.as_path()) =>
            {
                match hook.status {
                    HookStatus::Completed => {
                        debug!("download hook done");
                        self.start_download(ctx);
                    }
                    HookStatus::Output => debug!(line = %hook.message, "download hook"),
                    HookStatus::Failed | HookStatus::TimedOut => {
                        error!(message = %hook.message, "download hook failed");
                        ctx.job_failed(
                            &self.job,
                            JobFailedStatus::DownloadHookFailed,
                            Some(&hook.message),
                        );
                        ctx.publish_event(Event::DownloadInterrupted);
                    }
                }
            }
            Event::DownloadProgress { bytes } => {
                ctx.job_progress(
                    &self.job,
                    JobProgressStatus::DownloadProgress,
                    Some(&bytes.to_string()),
                );
            }
            Event::DownloadFailed { failure } => {
                match failure {
                    DownloadFailure::UrlExpired => warn!("download URL expired, starting over"),
                    DownloadFailure::Other(message) => error!(%message, "download failed"),
                }
                ctx.job_progress(&self.job, JobProgressStatus::DownloadInterrupt, None);
                ctx.publish_event(Event::DownloadInterrupted);
            }
            _ => {}
        }
    }
}
