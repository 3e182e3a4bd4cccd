//! Shared harness for the engine integration tests: a machine wired to
//! in-memory channels so the bus traffic can be observed and events can be
//! injected without a broker.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ota_agent_core::config::{BrokerConfig, Config, HooksConfig, ServiceConfig};
use ota_agent_core::jobs::{Job, JobStatus, StatusDetails};
use ota_agent_engine::events::Event;
use ota_agent_engine::machine::StateKind;
use ota_agent_engine::mqtt::{BusCommand, BusHandle};
use ota_agent_engine::{Context, Machine};
use tokio::sync::mpsc;

pub const THING: &str = "thing-under-test";

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub machine: Machine,
    pub inbox: mpsc::UnboundedSender<Event>,
    pub events: mpsc::UnboundedReceiver<Event>,
    pub bus: mpsc::UnboundedReceiver<BusCommand>,
    pub cfg: Arc<Config>,
    download_dir: tempfile::TempDir,
}

pub fn no_hooks() -> HooksConfig {
    HooksConfig {
        version: None,
        download: None,
        ready: None,
        install: None,
        restart: None,
        retry_interval: Duration::from_secs(1),
        max_retries: 3,
    }
}

pub fn harness(hooks: HooksConfig) -> Harness {
    let download_dir = tempfile::tempdir().unwrap();
    let cfg = Arc::new(Config {
        service: ServiceConfig {
            log_level: "debug".into(),
            download_location: download_dir.path().to_path_buf(),
            sentry: None,
        },
        broker: BrokerConfig {
            host: "127.0.0.1".into(),
            port: 1883,
            thing_name: THING.into(),
            client_id: "ota-agent".into(),
            tls: None,
        },
        hooks,
    });

    let (inbox, events) = mpsc::unbounded_channel();
    let (bus, bus_rx) = BusHandle::channel();
    let machine = Machine::new(Context {
        cfg: cfg.clone(),
        bus,
        inbox: inbox.clone(),
    });

    Harness {
        machine,
        inbox,
        events,
        bus: bus_rx,
        cfg,
        download_dir,
    }
}

impl Harness {
    pub fn download_location(&self) -> &Path {
        self.download_dir.path()
    }

    pub async fn next_event(&mut self) -> Event {
        tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for an inbox event")
            .expect("inbox closed")
    }

    /// Feeds inbox events back into the machine until it lands in `kind`.
    pub async fn run_until_state(&mut self, kind: StateKind) {
        while self.machine.state() != kind {
            let event = self.next_event().await;
            self.machine.dispatch(event);
        }
    }

    pub fn drain_bus(&mut self) -> Vec<BusCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = self.bus.try_recv() {
            commands.push(command);
        }
        commands
    }

    /// Published status updates seen so far, as `(job_id, status, sub_state,
    /// message)` tuples.
    pub fn drain_status_updates(&mut self) -> Vec<(String, String, String, String)> {
        self.drain_bus()
            .into_iter()
            .filter_map(|command| match command {
                BusCommand::Publish { topic, payload } => parse_status_update(&topic, &payload),
                _ => None,
            })
            .collect()
    }
}

pub fn parse_status_update(
    topic: &str,
    payload: &[u8],
) -> Option<(String, String, String, String)> {
    let job_id = topic
        .strip_prefix(&format!("$aws/things/{THING}/jobs/"))?
        .strip_suffix("/update")?
        .to_string();
    let body: serde_json::Value = serde_json::from_slice(payload).ok()?;
    Some((
        job_id,
        body["status"].as_str()?.to_string(),
        body["statusDetails"]["state"].as_str()?.to_string(),
        body["statusDetails"]["message"].as_str()?.to_string(),
    ))
}

pub fn job(id: &str, status: JobStatus, version: &str, force: bool) -> Job {
    Job {
        id: id.to_string(),
        status,
        file_url: "https://example.com/artifact".to_string(),
        version: version.to_string(),
        force,
        meta: None,
        status_details: None,
    }
}

pub fn in_progress_job(id: &str, version: &str, internal_state: &str) -> Job {
    let mut job = job(id, JobStatus::InProgress, version, false);
    job.status_details = Some(StatusDetails {
        state: internal_state.to_string(),
        message: "none".to_string(),
    });
    job
}

/// Writes an executable shell script for use as a hook.
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt as _;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A notify payload whose in-progress list contains exactly `ids`.
pub fn notify_payload(ids: &[&str]) -> Vec<u8> {
    let jobs: Vec<serde_json::Value> = ids
        .iter()
        .map(|id| serde_json::json!({"jobId": id, "queuedAt": 0}))
        .collect();
    serde_json::json!({"jobs": {"IN_PROGRESS": jobs}})
        .to_string()
        .into_bytes()
}

pub fn notify_topic() -> String {
    format!("$aws/things/{THING}/jobs/notify")
}

pub fn get_response_topic(filter: &str) -> String {
    format!("$aws/things/{THING}/jobs/get/{filter}")
}

pub fn describe_response_topic(job_id: &str, filter: &str) -> String {
    format!("$aws/things/{THING}/jobs/{job_id}/get/{filter}")
}

/// A GetPendingJobExecutions response payload.
pub fn pending_payload(in_progress: &[(&str, i64)], queued: &[(&str, i64)]) -> Vec<u8> {
    let summaries = |jobs: &[(&str, i64)]| -> Vec<serde_json::Value> {
        jobs.iter()
            .map(|(id, queued_at)| serde_json::json!({"jobId": id, "queuedAt": queued_at}))
            .collect()
    };
    serde_json::json!({
        "inProgressJobs": summaries(in_progress),
        "queuedJobs": summaries(queued),
    })
    .to_string()
    .into_bytes()
}

pub fn pending_jobs(in_progress: &[(&str, i64)], queued: &[(&str, i64)]) -> ota_agent_core::jobs::PendingJobs {
    ota_agent_core::jobs::parse_pending_jobs(&pending_payload(in_progress, queued)).unwrap()
}

/// An accepted DescribeJobExecution response for `job`.
pub fn describe_payload(job: &Job) -> Vec<u8> {
    serde_json::json!({
        "execution": {
            "jobId": job.id,
            "status": job.status,
            "statusDetails": job.status_details,
            "jobDocument": {
                "file": job.file_url,
                "version": job.version,
                "force": job.force,
                "meta": job.meta,
            },
        },
    })
    .to_string()
    .into_bytes()
}
