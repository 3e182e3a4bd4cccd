//! Topic strings and payloads of the AWS IoT Jobs convention.
//!
//! Everything in here is a pure function over strings and bytes; the bus
//! client and the state machine do the actual I/O.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

/// Jobs created by other services share the account's job channel; only ids
/// carrying this prefix belong to this agent, everything else is ignored.
pub const JOB_ID_PREFIX: &str = "ota_";

pub const ACCEPTED: &str = "accepted";
pub const REJECTED: &str = "rejected";

pub fn is_our_job(job_id: &str) -> bool {
    job_id.starts_with(JOB_ID_PREFIX)
}

fn jobs_base(thing_name: &str) -> String {
    format!("$aws/things/{thing_name}/jobs")
}

pub fn get_pending_job_executions(thing_name: &str) -> String {
    format!("{}/get", jobs_base(thing_name))
}

pub fn get_pending_job_executions_response(thing_name: &str, state_filter: Option<&str>) -> String {
    format!(
        "{}/get/{}",
        jobs_base(thing_name),
        state_filter.unwrap_or("+")
    )
}

pub fn pending_jobs_response(thing_name: &str) -> String {
    format!("{}/notify", jobs_base(thing_name))
}

pub fn describe_job_execution(thing_name: &str, job_id: &str) -> String {
    format!("{}/{job_id}/get", jobs_base(thing_name))
}

pub fn describe_job_execution_response(
    thing_name: &str,
    job_id: &str,
    state_filter: Option<&str>,
) -> String {
    format!(
        "{}/{job_id}/get/{}",
        jobs_base(thing_name),
        state_filter.unwrap_or("+")
    )
}

pub fn update_job_execution(thing_name: &str, job_id: &str) -> String {
    format!("{}/{job_id}/update", jobs_base(thing_name))
}

/// MQTT filter matching for the `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (None, None) => return true,
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            _ => return false,
        }
    }
}

/// Top-level execution status as tracked by the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    InProgress,
    Failed,
    Succeeded,
    Canceled,
    TimedOut,
    Rejected,
    Removed,
}

/// Device-defined sub-states reported while a job is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobProgressStatus {
    DownloadStart,
    DownloadProgress,
    DownloadInterrupt,
    InstallationStart,
    InstallationProgress,
    InstallationInterrupt,
    RebootStart,
    RebootInterrupt,
    ErrorMultipleInProgress,
}

impl JobProgressStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobProgressStatus::DownloadStart => "download_start",
            JobProgressStatus::DownloadProgress => "download_progress",
            JobProgressStatus::DownloadInterrupt => "download_interrupt",
            JobProgressStatus::InstallationStart => "installation_start",
            JobProgressStatus::InstallationProgress => "installation_progress",
            JobProgressStatus::InstallationInterrupt => "installation_interrupt",
            JobProgressStatus::RebootStart => "reboot_start",
            JobProgressStatus::RebootInterrupt => "reboot_interrupt",
            JobProgressStatus::ErrorMultipleInProgress => "error_multiple_in_progress",
        }
    }
}

/// Device-defined sub-states reported with a SUCCEEDED update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSuccessStatus {
    VersionAlreadyInstalled,
    NoInstallationHookProvided,
    NoRestartHookProvided,
    CompleteSoftRestart,
    CompleteNoVersionCheck,
    CompleteNoReadyCheck,
    CompleteReady,
}

impl JobSuccessStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobSuccessStatus::VersionAlreadyInstalled => "version_already_installed",
            JobSuccessStatus::NoInstallationHookProvided => "no_installation_hook_provided",
            JobSuccessStatus::NoRestartHookProvided => "no_restart_hook_provided",
            JobSuccessStatus::CompleteSoftRestart => "complete_soft_restart",
            JobSuccessStatus::CompleteNoVersionCheck => "complete_no_version_check",
            JobSuccessStatus::CompleteNoReadyCheck => "complete_no_ready_check",
            JobSuccessStatus::CompleteReady => "complete_ready",
        }
    }
}

/// Device-defined sub-states reported with a FAILED update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFailedStatus {
    InstallationHookFailed,
    DownloadHookFailed,
    RestartHookFailed,
    VersionHookFailed,
    ReadyHookFailed,
    VersionMismatch,
}

impl JobFailedStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobFailedStatus::InstallationHookFailed => "installation_hook_failed",
            JobFailedStatus::DownloadHookFailed => "download_hook_failed",
            JobFailedStatus::RestartHookFailed => "restart_hook_failed",
            JobFailedStatus::VersionHookFailed => "version_hook_failed",
            JobFailedStatus::ReadyHookFailed => "ready_hook_failed",
            JobFailedStatus::VersionMismatch => "version_mismatch",
        }
    }
}

/// Sub-state persisted in the cloud alongside the top-level status. After a
/// reboot this is the only record of where the update process left off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDetails {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub message: String,
}

/// Builds the JSON body published to the per-job `update` topic.
pub fn status_update(status: JobStatus, state: &str, message: Option<&str>) -> String {
    serde_json::json!({
        "status": status,
        "statusDetails": {
            "state": state,
            "message": message.unwrap_or("none"),
        },
    })
    .to_string()
}

/// A cloud-issued update work item targeted at this device. Immutable after
/// construction; status changes are written back through the cloud.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub file_url: String,
    pub version: String,
    pub force: bool,
    pub meta: Option<String>,
    pub status_details: Option<StatusDetails>,
}

impl Job {
    pub fn internal_state(&self) -> Option<&str> {
        self.status_details.as_ref().map(|d| d.state.as_str())
    }

    /// Deterministic local path of the artifact: two jobs never share one.
    pub fn artifact_path(&self, download_location: &Path) -> PathBuf {
        download_location.join(&self.id)
    }

    pub fn meta_arg(&self) -> String {
        self.meta.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobExecutionSummary {
    #[serde(rename = "jobId")]
    pub job_id: String,
    #[serde(default, rename = "queuedAt")]
    pub queued_at: i64,
}

/// Pending executions as returned by GetPendingJobExecutions or pushed on
/// the notify topic.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PendingJobs {
    #[serde(default, rename = "inProgressJobs")]
    pub in_progress: Vec<JobExecutionSummary>,
    #[serde(default, rename = "queuedJobs")]
    pub queued: Vec<JobExecutionSummary>,
}

impl PendingJobs {
    pub fn is_empty(&self) -> bool {
        self.in_progress.is_empty() && self.queued.is_empty()
    }

    pub fn retain_ours(&mut self) {
        self.in_progress.retain(|job| is_our_job(&job.job_id));
        self.queued.retain(|job| is_our_job(&job.job_id));
    }

    /// The queued execution that has been waiting the longest.
    pub fn oldest_queued(&self) -> Option<&JobExecutionSummary> {
        self.queued.iter().min_by_key(|job| job.queued_at)
    }
}

pub fn parse_pending_jobs(payload: &[u8]) -> Option<PendingJobs> {
    serde_json::from_slice(payload).ok()
}

#[derive(Debug, Default, Deserialize)]
struct NotifyJobs {
    #[serde(default, rename = "IN_PROGRESS")]
    in_progress: Vec<JobExecutionSummary>,
    #[serde(default, rename = "QUEUED")]
    queued: Vec<JobExecutionSummary>,
}

#[derive(Debug, Deserialize)]
struct NotifyPayload {
    #[serde(default)]
    jobs: NotifyJobs,
}

/// Parses a pending-jobs notification into the same shape as a get response.
pub fn parse_notify(payload: &[u8]) -> Option<PendingJobs> {
    let notify: NotifyPayload = serde_json::from_slice(payload).ok()?;
    Some(PendingJobs {
        in_progress: notify.jobs.in_progress,
        queued: notify.jobs.queued,
    })
}

/// Ids of the executions a notification reports as in progress. `None` on a
/// payload we cannot parse, so callers do not mistake garbage for "gone".
pub fn in_progress_ids(payload: &[u8]) -> Option<Vec<String>> {
    let notify: NotifyPayload = serde_json::from_slice(payload).ok()?;
    Some(
        notify
            .jobs
            .in_progress
            .into_iter()
            .map(|job| job.job_id)
            .collect(),
    )
}

#[derive(Debug, Deserialize)]
struct JobDocument {
    file: String,
    version: String,
    #[serde(default, deserialize_with = "deserialize_force")]
    force: bool,
    #[serde(default)]
    meta: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobExecution {
    #[serde(rename = "jobId")]
    job_id: String,
    status: JobStatus,
    #[serde(default, rename = "statusDetails")]
    status_details: Option<StatusDetails>,
    #[serde(rename = "jobDocument")]
    document: JobDocument,
}

#[derive(Debug, Deserialize)]
struct DescribeResponse {
    execution: JobExecution,
}

/// Builds a [`Job`] from an accepted DescribeJobExecution response. `None`
/// when the execution or its document is missing or malformed.
pub fn parse_describe_response(payload: &[u8]) -> Option<Job> {
    let response: DescribeResponse = serde_json::from_slice(payload).ok()?;
    let execution = response.execution;
    Some(Job {
        id: execution.job_id,
        status: execution.status,
        file_url: execution.document.file,
        version: execution.document.version,
        force: execution.document.force,
        meta: execution.document.meta,
        status_details: execution.status_details,
    })
}

#[derive(Debug, Deserialize)]
struct RejectedPayload {
    #[serde(default)]
    message: String,
}

pub fn rejection_message(payload: &[u8]) -> String {
    serde_json::from_slice::<RejectedPayload>(payload)
        .map(|rejected| rejected.message)
        .unwrap_or_default()
}

/// The job document's `force` flag shows up either as a JSON boolean or as a
/// string written by humans; both are accepted.
fn deserialize_force<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(false),
        Some(Raw::Bool(value)) => Ok(value),
        Some(Raw::Text(value)) => Ok(matches!(
            value.to_ascii_lowercase().as_str(),
            "yes" | "true" | "on" | "1"
        )),
    }
}
