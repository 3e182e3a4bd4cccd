//! The event vocabulary of the inbox.
//!
//! Every producer — bus task, hook runners, downloader tasks, the signal
//! handler and the states themselves — enqueues [`Event`]s; the state
//! machine consumes them on a single task. [`Event::name`] strips the
//! payload so transitions can be looked up by discriminant.

use std::path::PathBuf;

use ota_agent_core::jobs::{Job, PendingJobs};
use tokio::sync::mpsc;

/// Sender half of the inbox.
pub type Inbox = mpsc::UnboundedSender<Event>;

#[derive(Debug, Clone)]
pub enum Event {
    // State machine flow.
    NoJobsPending,
    JobsAvailable { summaries: PendingJobs },
    SelectJobInterrupted,
    JobSelected { job: Job },
    JobVerified { job: Job },
    JobRevoked,
    JobInstallationDone { job: Job },
    JobInstallationComplete,
    DownloadCompleted { job: Job },
    DownloadInterrupted,
    InstallationDone { job: Job },
    InstallationInterrupted,
    RestartInterrupted,

    // Downloader lifecycle, consumed by the download state.
    DownloadProgress { bytes: u64 },
    DownloadFailed { failure: DownloadFailure },

    // Bus I/O.
    MqttMessageReceived { topic: String, payload: Vec<u8> },
    MqttSubscribed { topic: String },
    MqttUnsubscribed { topic: String },

    // Hook lifecycle.
    Hook(HookEvent),

    // Signals.
    ExitSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    NoJobsPending,
    JobsAvailable,
    SelectJobInterrupted,
    JobSelected,
    JobVerified,
    JobRevoked,
    JobInstallationDone,
    JobInstallationComplete,
    DownloadCompleted,
    DownloadInterrupted,
    InstallationDone,
    InstallationInterrupted,
    RestartInterrupted,
    DownloadProgress,
    DownloadFailed,
    MqttMessageReceived,
    MqttSubscribed,
    MqttUnsubscribed,
    Hook,
    ExitSignal,
}

impl Event {
    pub fn name(&self) -> EventName {
        match self {
            Event::NoJobsPending => EventName::NoJobsPending,
            Event::JobsAvailable { .. } => EventName::JobsAvailable,
            Event::SelectJobInterrupted => EventName::SelectJobInterrupted,
            Event::JobSelected { .. } => EventName::JobSelected,
            Event::JobVerified { .. } => EventName::JobVerified,
            Event::JobRevoked => EventName::JobRevoked,
            Event::JobInstallationDone { .. } => EventName::JobInstallationDone,
            Event::JobInstallationComplete => EventName::JobInstallationComplete,
            Event::DownloadCompleted { .. } => EventName::DownloadCompleted,
            Event::DownloadInterrupted => EventName::DownloadInterrupted,
            Event::InstallationDone { .. } => EventName::InstallationDone,
            Event::InstallationInterrupted => EventName::InstallationInterrupted,
            Event::RestartInterrupted => EventName::RestartInterrupted,
            Event::DownloadProgress { .. } => EventName::DownloadProgress,
            Event::DownloadFailed { .. } => EventName::DownloadFailed,
            Event::MqttMessageReceived { .. } => EventName::MqttMessageReceived,
            Event::MqttSubscribed { .. } => EventName::MqttSubscribed,
            Event::MqttUnsubscribed { .. } => EventName::MqttUnsubscribed,
            Event::Hook(_) => EventName::Hook,
            Event::ExitSignal => EventName::ExitSignal,
        }
    }
}

/// Lifecycle event of one hook invocation. `command` identifies the hook so
/// states only react to the executables they started.
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub command: PathBuf,
    pub status: HookStatus,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStatus {
    /// One non-empty line of child stdout.
    Output,
    /// Exit code 0; the message carries the last observed line.
    Completed,
    /// Non-zero, non-retry exit, a spawn failure or a read failure.
    Failed,
    /// The retry budget ran out.
    TimedOut,
}

/// Terminal downloader failures that are not plain completion.
#[derive(Debug, Clone)]
pub enum DownloadFailure {
    /// The pre-signed URL is no longer accepted (HTTP 403); re-fetching the
    /// job yields a fresh one.
    UrlExpired,
    /// Anything unexpected; the state machine recovers by re-fetching.
    Other(String),
}
