//! The per-state behaviors, plus the cancellation watcher every
//! job-processing state is wrapped in.

mod download;
mod fetch_jobs;
mod install;
mod monitor;
mod restart;
mod select_job;
mod verify_installation;
mod verify_job;

pub(crate) use download::DownloadState;
pub(crate) use fetch_jobs::FetchJobsState;
pub(crate) use install::InstallState;
pub(crate) use monitor::MonitorState;
pub(crate) use restart::RestartState;
pub(crate) use select_job::SelectJobState;
pub(crate) use verify_installation::VerifyInstallationState;
pub(crate) use verify_job::VerifyJobState;

use ota_agent_core::config::Config;
use ota_agent_core::jobs::{self, Job};
use rumqttc::QoS;
use tracing::{info, warn};

use crate::events::Event;
use crate::machine::Context;

pub(crate) trait State {
    fn on_enter(&mut self, ctx: &Context);
    fn on_exit(&mut self, ctx: &Context);
    fn handle(&mut self, ctx: &Context, event: &Event);
}

/// A state that owns one job under execution. [`Watched`] supplies the
/// shared behavior; the state itself only deals with its own events and with
/// `on_job_cancelled`, which must stop the state's workers and publish the
/// state-local interruption event.
pub(crate) trait JobState {
    fn job(&self) -> &Job;
    fn on_enter(&mut self, ctx: &Context);
    fn on_exit(&mut self, ctx: &Context);
    fn on_job_cancelled(&mut self, ctx: &Context);

    /// Bus messages, after the cancellation check.
    fn on_message(&mut self, _ctx: &Context, _topic: &str, _payload: &[u8]) {}

    /// Everything that is not a bus message.
    fn handle(&mut self, _ctx: &Context, _event: &Event) {}
}

/// Watches the pending-jobs notifications while the wrapped state runs: when
/// our job disappears from the in-progress list it has been canceled or
/// deleted server-side, and the state is short-circuited. The check runs
/// before the wrapped state sees the message.
pub(crate) struct Watched<S: JobState> {
    inner: S,
    pending_jobs_response: String,
}

impl<S: JobState> Watched<S> {
    pub(crate) fn new(inner: S, cfg: &Config) -> Self {
        Watched {
            pending_jobs_response: jobs::pending_jobs_response(&cfg.broker.thing_name),
            inner,
        }
    }
}

impl<S: JobState> State for Watched<S> {
    fn on_enter(&mut self, ctx: &Context) {
        ctx.bus
            .subscribe(&self.pending_jobs_response, QoS::AtLeastOnce);
        self.inner.on_enter(ctx);
    }

    fn on_exit(&mut self, ctx: &Context) {
        ctx.bus.unsubscribe(&self.pending_jobs_response);
        self.inner.on_exit(ctx);
    }

    fn handle(&mut self, ctx: &Context, event: &Event) {
        match event {
            Event::MqttMessageReceived { topic, payload } => {
                if jobs::topic_matches(&self.pending_jobs_response, topic) {
                    match jobs::in_progress_ids(payload) {
                        Some(in_progress) => {
                            let job_id = self.inner.job().id.clone();
                            if !in_progress.contains(&job_id) {
                                info!(%job_id, "job got canceled");
                                self.inner.on_job_cancelled(ctx);
                                return;
                            }
                        }
                        None => warn!("unparseable pending jobs notification"),
                    }
                }
                self.inner.on_message(ctx, topic, payload);
            }
            other => self.inner.handle(ctx, other),
        }
    }
}
