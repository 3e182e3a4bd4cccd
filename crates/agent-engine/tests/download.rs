mod common;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ota_agent_core::jobs::{Job, JobStatus};
use ota_agent_engine::download::spawn_download;
use ota_agent_engine::events::{DownloadFailure, Event};
use tokio::sync::mpsc;
use warp::Filter as _;

use crate::common::job;

const ARTIFACT_SIZE: usize = 300;

fn artifact_body() -> Vec<u8> {
    (0..ARTIFACT_SIZE).map(|i| (i % 251) as u8).collect()
}

fn range_start(range: &str) -> usize {
    range
        .strip_prefix("bytes=")
        .and_then(|rest| rest.strip_suffix('-'))
        .and_then(|start| start.parse().ok())
        .unwrap_or(0)
}

/// Serves the artifact with range support and records every Range header.
fn spawn_range_server(seen_ranges: Arc<Mutex<Vec<String>>>) -> SocketAddr {
    let route = warp::path("artifact")
        .and(warp::header::optional::<String>("range"))
        .map(move |range: Option<String>| {
            let range = range.unwrap_or_default();
            seen_ranges.lock().unwrap().push(range.clone());
            let start = range_start(&range);
            let body = artifact_body();
            if start >= body.len() {
                warp::http::Response::builder()
                    .status(416)
                    .body(Vec::new())
                    .unwrap()
            } else if start > 0 {
                warp::http::Response::builder()
                    .status(206)
                    .body(body[start..].to_vec())
                    .unwrap()
            } else {
                warp::http::Response::builder()
                    .status(200)
                    .body(body)
                    .unwrap()
            }
        });
    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

fn spawn_fixed_status_server(status: u16) -> SocketAddr {
    let route = warp::path("artifact").map(move || {
        warp::http::Response::builder()
            .status(status)
            .body(Vec::new())
            .unwrap()
    });
    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

fn artifact_job(id: &str, addr: SocketAddr) -> Job {
    let mut job = job(id, JobStatus::Queued, "1.0.0", false);
    job.file_url = format!("http://{addr}/artifact");
    job
}

async fn collect_outcome(
    events: &mut mpsc::UnboundedReceiver<Event>,
) -> (Vec<u64>, Option<Event>) {
    let mut progress = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a download event")
            .expect("inbox closed");
        match event {
            Event::DownloadProgress { bytes } => progress.push(bytes),
            terminal => return (progress, Some(terminal)),
        }
    }
}

#[tokio::test]
async fn fresh_download_starts_at_byte_zero() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let addr = spawn_range_server(seen.clone());
    let job = artifact_job("ota_fresh", addr);
    let target = job.artifact_path(dir.path());

    let (inbox, mut events) = mpsc::unbounded_channel();
    spawn_download(job.clone(), dir.path().to_path_buf(), inbox);

    let (progress, terminal) = collect_outcome(&mut events).await;
    assert!(matches!(terminal, Some(Event::DownloadCompleted { job: done }) if done.id == job.id));

    assert_eq!(seen.lock().unwrap().first().map(String::as_str), Some("bytes=0-"));
    assert_eq!(std::fs::read(&target).unwrap(), artifact_body());

    // Byte counts grow monotonically up to the full size.
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(progress.last().copied(), Some(ARTIFACT_SIZE as u64));
}

#[tokio::test]
async fn partial_download_resumes_where_it_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let addr = spawn_range_server(seen.clone());
    let job = artifact_job("ota_resume", addr);
    let target = job.artifact_path(dir.path());

    std::fs::write(&target, &artifact_body()[..50]).unwrap();

    let (inbox, mut events) = mpsc::unbounded_channel();
    spawn_download(job, dir.path().to_path_buf(), inbox);

    let (progress, terminal) = collect_outcome(&mut events).await;
    assert!(matches!(terminal, Some(Event::DownloadCompleted { .. })));

    assert_eq!(seen.lock().unwrap().first().map(String::as_str), Some("bytes=50-"));
    assert_eq!(std::fs::read(&target).unwrap(), artifact_body());
    assert_eq!(progress.last().copied(), Some(ARTIFACT_SIZE as u64));
}

#[tokio::test]
async fn range_not_satisfiable_counts_as_completed() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_range_server(Arc::new(Mutex::new(Vec::new())));
    let job = artifact_job("ota_done", addr);
    let target = job.artifact_path(dir.path());

    // The whole artifact is already on disk; the server answers 416.
    std::fs::write(&target, artifact_body()).unwrap();

    let (inbox, mut events) = mpsc::unbounded_channel();
    spawn_download(job, dir.path().to_path_buf(), inbox);

    let (progress, terminal) = collect_outcome(&mut events).await;
    assert!(progress.is_empty());
    assert!(matches!(terminal, Some(Event::DownloadCompleted { .. })));
    assert_eq!(std::fs::read(&target).unwrap(), artifact_body());
}

#[tokio::test]
async fn forbidden_means_the_url_expired() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_fixed_status_server(403);
    let job = artifact_job("ota_expired", addr);
    let target = job.artifact_path(dir.path());

    // Keep a partial around: it must survive for the later resume.
    std::fs::write(&target, &artifact_body()[..50]).unwrap();

    let (inbox, mut events) = mpsc::unbounded_channel();
    spawn_download(job, dir.path().to_path_buf(), inbox);

    let (progress, terminal) = collect_outcome(&mut events).await;
    assert!(progress.is_empty());
    assert!(matches!(
        terminal,
        Some(Event::DownloadFailed {
            failure: DownloadFailure::UrlExpired
        })
    ));
    assert_eq!(std::fs::read(&target).unwrap(), &artifact_body()[..50]);
}

#[tokio::test]
async fn stale_artifacts_are_purged_before_the_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_range_server(Arc::new(Mutex::new(Vec::new())));
    let job = artifact_job("ota_current", addr);
    let target = job.artifact_path(dir.path());

    std::fs::write(dir.path().join("ota_previous"), b"old artifact").unwrap();
    std::fs::write(dir.path().join("ota_older"), b"older artifact").unwrap();
    // A partial of the current job is not stale.
    std::fs::write(&target, &artifact_body()[..50]).unwrap();

    let (inbox, mut events) = mpsc::unbounded_channel();
    spawn_download(job, dir.path().to_path_buf(), inbox);

    let (_, terminal) = collect_outcome(&mut events).await;
    assert!(matches!(terminal, Some(Event::DownloadCompleted { .. })));

    let mut remaining: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    remaining.sort();
    assert_eq!(remaining, ["ota_current"]);
    assert_eq!(std::fs::read(&target).unwrap(), artifact_body());
}

#[tokio::test]
async fn transient_server_errors_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    // Fails twice with 500, then serves the artifact.
    let hits = Arc::new(Mutex::new(0u32));
    let route = warp::path("artifact").map(move || {
        let mut hits = hits.lock().unwrap();
        *hits += 1;
        if *hits <= 2 {
            warp::http::Response::builder()
                .status(500)
                .body(Vec::new())
                .unwrap()
        } else {
            warp::http::Response::builder()
                .status(200)
                .body(artifact_body())
                .unwrap()
        }
    });
    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);

    let job = artifact_job("ota_flaky", addr);
    let target = job.artifact_path(dir.path());

    let (inbox, mut events) = mpsc::unbounded_channel();
    spawn_download(job, dir.path().to_path_buf(), inbox);

    let (_, terminal) = tokio::time::timeout(Duration::from_secs(30), collect_outcome(&mut events))
        .await
        .expect("retries did not converge");
    assert!(matches!(terminal, Some(Event::DownloadCompleted { .. })));
    assert_eq!(std::fs::read(&target).unwrap(), artifact_body());
}

#[tokio::test]
async fn cancellation_removes_the_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    // A server that never answers usefully keeps the downloader in its
    // retry loop.
    let addr = spawn_fixed_status_server(500);
    let job = artifact_job("ota_cancelled", addr);
    let target = job.artifact_path(dir.path());

    std::fs::write(&target, &artifact_body()[..50]).unwrap();

    let (inbox, mut events) = mpsc::unbounded_channel();
    let cancel = spawn_download(job, dir.path().to_path_buf(), inbox);
    cancel.set();

    // The partial disappears and no terminal event is published.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while target.exists() {
        assert!(tokio::time::Instant::now() < deadline, "partial was not removed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    while let Ok(event) = events.try_recv() {
        assert!(
            matches!(event, Event::DownloadProgress { .. }),
            "unexpected event after cancellation: {event:?}"
        );
    }
}

#[tokio::test]
async fn artifact_paths_never_collide_between_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let a = job("ota_a", JobStatus::Queued, "1", false);
    let b = job("ota_b", JobStatus::Queued, "1", false);
    assert_ne!(a.artifact_path(dir.path()), b.artifact_path(dir.path()));
}
