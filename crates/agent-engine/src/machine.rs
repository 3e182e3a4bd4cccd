//! The state machine: eight states, one dispatch table, one task.
//!
//! Dispatch is synchronous and runs on the event-loop task only; states
//! start background work (hooks, downloads) and hear back about it through
//! inbox events. A transition tears the old state down, builds the next one
//! from the event payload and enters it.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use ota_agent_core::config::Config;
use ota_agent_core::jobs::{
    self, Job, JobFailedStatus, JobProgressStatus, JobStatus, JobSuccessStatus,
};
use tracing::{error, info};

use crate::events::{Event, EventName, Inbox};
use crate::hooks::RetryPolicy;
use crate::mqtt::BusHandle;
use crate::states::{
    DownloadState, FetchJobsState, InstallState, MonitorState, RestartState, SelectJobState,
    State, VerifyInstallationState, VerifyJobState, Watched,
};

/// Everything a state needs to act on the outside world. Passed by reference
/// into every handler.
#[derive(Debug, Clone)]
pub struct Context {
    pub cfg: Arc<Config>,
    pub bus: BusHandle,
    pub inbox: Inbox,
}

impl Context {
    pub(crate) fn publish_event(&self, event: Event) {
        let _ = self.inbox.send(event);
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.cfg.hooks)
    }

    pub(crate) fn update_job(
        &self,
        job_id: &str,
        status: JobStatus,
        state: &str,
        message: Option<&str>,
    ) {
        self.bus.publish(
            jobs::update_job_execution(&self.cfg.broker.thing_name, job_id),
            jobs::status_update(status, state, message),
        );
    }

    pub(crate) fn job_succeeded(&self, job: &Job, state: JobSuccessStatus, message: Option<&str>) {
        self.update_job(&job.id, JobStatus::Succeeded, state.as_str(), message);
    }

    pub(crate) fn job_failed(&self, job: &Job, state: JobFailedStatus, message: Option<&str>) {
        self.update_job(&job.id, JobStatus::Failed, state.as_str(), message);
    }

    pub(crate) fn job_progress(&self, job: &Job, state: JobProgressStatus, message: Option<&str>) {
        self.update_job(&job.id, JobStatus::InProgress, state.as_str(), message);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    FetchJobs,
    Monitor,
    SelectJob,
    VerifyJob,
    Download,
    Install,
    Restart,
    VerifyInstallation,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StateKind::FetchJobs => "fetch_jobs",
            StateKind::Monitor => "monitor",
            StateKind::SelectJob => "select_job",
            StateKind::VerifyJob => "verify_job",
            StateKind::Download => "download",
            StateKind::Install => "install",
            StateKind::Restart => "restart",
            StateKind::VerifyInstallation => "verify_installation",
        })
    }
}

/// The transition table. Events outside of it are handled inside the current
/// state and never change it.
pub fn transition(state: StateKind, event: EventName) -> Option<StateKind> {
    use EventName as E;
    use StateKind as S;

    Some(match (state, event) {
        (S::FetchJobs, E::NoJobsPending) => S::Monitor,
        (S::FetchJobs, E::JobsAvailable) => S::SelectJob,
        (S::Monitor, E::JobsAvailable) => S::SelectJob,
        (S::SelectJob, E::JobSelected) => S::VerifyJob,
        (S::SelectJob, E::SelectJobInterrupted) => S::FetchJobs,
        (S::VerifyJob, E::JobVerified) => S::Download,
        (S::VerifyJob, E::JobRevoked) => S::FetchJobs,
        (S::VerifyJob, E::JobInstallationDone) => S::VerifyInstallation,
        (S::Download, E::DownloadCompleted) => S::Install,
        (S::Download, E::DownloadInterrupted) => S::FetchJobs,
        (S::Install, E::InstallationDone) => S::Restart,
        (S::Install, E::InstallationInterrupted) => S::FetchJobs,
        (S::Restart, E::RestartInterrupted) => S::FetchJobs,
        (S::VerifyInstallation, E::JobInstallationComplete) => S::FetchJobs,
        _ => return None,
    })
}

enum StateSlot {
    FetchJobs(FetchJobsState),
    Monitor(MonitorState),
    SelectJob(SelectJobState),
    VerifyJob(Watched<VerifyJobState>),
    Download(Watched<DownloadState>),
    Install(Watched<InstallState>),
    Restart(Watched<RestartState>),
    VerifyInstallation(Watched<VerifyInstallationState>),
}

impl StateSlot {
    fn kind(&self) -> StateKind {
        match self {
            StateSlot::FetchJobs(_) => StateKind::FetchJobs,
            StateSlot::Monitor(_) => StateKind::Monitor,
            StateSlot::SelectJob(_) => StateKind::SelectJob,
            StateSlot::VerifyJob(_) => StateKind::VerifyJob,
            StateSlot::Download(_) => StateKind::Download,
            StateSlot::Install(_) => StateKind::Install,
            StateSlot::Restart(_) => StateKind::Restart,
            StateSlot::VerifyInstallation(_) => StateKind::VerifyInstallation,
        }
    }

    fn as_state(&mut self) -> &mut dyn State {
        match self {
            StateSlot::FetchJobs(state) => state,
            StateSlot::Monitor(state) => state,
            StateSlot::SelectJob(state) => state,
            StateSlot::VerifyJob(state) => state,
            StateSlot::Download(state) => state,
            StateSlot::Install(state) => state,
            StateSlot::Restart(state) => state,
            StateSlot::VerifyInstallation(state) => state,
        }
    }
}

pub struct Machine {
    ctx: Context,
    state: StateSlot,
}

impl Machine {
    pub fn new(ctx: Context) -> Self {
        let state = StateSlot::FetchJobs(FetchJobsState::new(&ctx.cfg));
        Machine { ctx, state }
    }

    pub fn state(&self) -> StateKind {
        self.state.kind()
    }

    /// Enters the initial state.
    pub fn start(&mut self) {
        info!(state = %self.state.kind(), "starting in initial state");
        self.state.as_state().on_enter(&self.ctx);
    }

    /// Routes one inbox event. Returns `Break` when the agent should shut
    /// down.
    pub fn dispatch(&mut self, event: Event) -> ControlFlow<()> {
        if matches!(event, Event::ExitSignal) {
            info!("shutting down");
            self.state.as_state().on_exit(&self.ctx);
            self.ctx.bus.disconnect();
            return ControlFlow::Break(());
        }

        let from = self.state.kind();
        match transition(from, event.name()) {
            Some(next) => {
                self.state.as_state().on_exit(&self.ctx);
                let mut slot = build_state(next, event, &self.ctx);
                slot.as_state().on_enter(&self.ctx);
                self.state = slot;
                info!(%from, to = %next, "state changed");
            }
            None => self.state.as_state().handle(&self.ctx, &event),
        }
        ControlFlow::Continue(())
    }
}

fn build_state(next: StateKind, event: Event, ctx: &Context) -> StateSlot {
    let cfg = ctx.cfg.as_ref();
    match (next, event) {
        (StateKind::FetchJobs, _) => StateSlot::FetchJobs(FetchJobsState::new(cfg)),
        (StateKind::Monitor, _) => StateSlot::Monitor(MonitorState::new(cfg)),
        (StateKind::SelectJob, Event::JobsAvailable { summaries }) => {
            StateSlot::SelectJob(SelectJobState::new(summaries))
        }
        (StateKind::VerifyJob, Event::JobSelected { job }) => {
            StateSlot::VerifyJob(Watched::new(VerifyJobState::new(job), cfg))
        }
        (StateKind::Download, Event::JobVerified { job }) => {
            StateSlot::Download(Watched::new(DownloadState::new(job), cfg))
        }
        (StateKind::Install, Event::DownloadCompleted { job }) => {
            StateSlot::Install(Watched::new(InstallState::new(job), cfg))
        }
        (StateKind::Restart, Event::InstallationDone { job }) => {
            StateSlot::Restart(Watched::new(RestartState::new(job), cfg))
        }
        (StateKind::VerifyInstallation, Event::JobInstallationDone { job }) => {
            StateSlot::VerifyInstallation(Watched::new(VerifyInstallationState::new(job), cfg))
        }
        (next, event) => {
            // Transition table and payload carriers disagree; recover by
            // refetching instead of running a state without its job.
            error!(state = %next, event = ?event.name(), "transition event without payload");
            StateSlot::FetchJobs(FetchJobsState::new(cfg))
        }
    }
}
