//! Resumable artifact downloader.
//!
//! One task per download. A partial file is picked up where it left off via
//! an HTTP range request; every chunk is flushed and fsynced so a crash
//! mid-download resumes instead of restarting. Transient transport errors
//! retry with full-jitter exponential backoff; a 416 means the file is
//! already complete, a 403 means the pre-signed URL expired and the job has
//! to be re-fetched for a fresh one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use ota_agent_core::jobs::Job;
use rand::Rng as _;
use reqwest::StatusCode;
use tokio::fs;
use tokio::io::AsyncWriteExt as _;
use tracing::{error, info, warn};

use crate::cancel::CancelFlag;
use crate::events::{DownloadFailure, Event, Inbox};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const BACKOFF_BASE_SECS: u64 = 1;
const BACKOFF_CAP: Duration = Duration::from_secs(64);

/// Spawns the downloader for `job` and returns its cancel flag. Cancellation
/// stops the transfer at the next chunk boundary and removes the partial
/// file; completion and failure are reported through the inbox.
pub fn spawn_download(job: Job, download_location: PathBuf, inbox: Inbox) -> Arc<CancelFlag> {
    let cancel = Arc::new(CancelFlag::default());
    tokio::spawn(download_task(job, download_location, inbox, cancel.clone()));
    cancel
}

enum Outcome {
    Completed,
    Cancelled,
    UrlExpired,
}

async fn download_task(job: Job, download_location: PathBuf, inbox: Inbox, cancel: Arc<CancelFlag>) {
    let target = job.artifact_path(&download_location);

    // Artifacts of other jobs are stale; only the current target survives so
    // a same-job resume keeps working.
    if let Err(err) = purge_stale_artifacts(&download_location, &target).await {
        warn!(error = %err, "unable to purge download location");
    }

    info!(job_id = %job.id, path = %target.display(), "downloading artifact");
    match fetch(&job, &target, &inbox, &cancel).await {
        Ok(Outcome::Completed) => {
            info!(job_id = %job.id, "download completed");
            let _ = inbox.send(Event::DownloadCompleted { job });
        }
        Ok(Outcome::Cancelled) => {
            info!(job_id = %job.id, "download stopped, removing {}", target.display());
            let _ = fs::remove_file(&target).await;
        }
        Ok(Outcome::UrlExpired) => {
            let _ = inbox.send(Event::DownloadFailed {
                failure: DownloadFailure::UrlExpired,
            });
        }
        // Nothing in here may take the event loop down with it; unexpected
        // errors surface as an interruption and the machine re-fetches.
        Err(err) => {
            error!(job_id = %job.id, error = format!("{err:#}"), "download failed");
            let _ = inbox.send(Event::DownloadFailed {
                failure: DownloadFailure::Other(format!("{err:#}")),
            });
        }
    }
}

async fn fetch(job: &Job, target: &Path, inbox: &Inbox, cancel: &CancelFlag) -> anyhow::Result<Outcome> {
    let client = reqwest::Client::builder()
        .connect_timeout(REQUEST_TIMEOUT)
        .read_timeout(REQUEST_TIMEOUT)
        .build()
        .context("build http client")?;

    let mut attempt: u32 = 0;
    loop {
        if cancel.is_set() {
            return Ok(Outcome::Cancelled);
        }

        let start = match fs::metadata(target).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if start > 0 {
            info!(bytes = start, "partial download found, resuming");
        }

        let response = client
            .get(&job.file_url)
            .header(reqwest::header::RANGE, format!("bytes={start}-"))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "request failed, retrying");
                if backoff_wait(attempt, cancel).await {
                    return Ok(Outcome::Cancelled);
                }
                attempt += 1;
                continue;
            }
        };

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            // Unsatisfiable range: we already have all the bytes.
            return Ok(Outcome::Completed);
        } else if status == StatusCode::FORBIDDEN {
            warn!("download URL has expired");
            return Ok(Outcome::UrlExpired);
        } else if status.is_success() {
            match write_body(response, target, start, inbox, cancel).await? {
                Written::Done => return Ok(Outcome::Completed),
                Written::Cancelled => return Ok(Outcome::Cancelled),
                Written::Lost(err) => {
                    warn!(error = %err, "transfer interrupted, retrying");
                }
            }
        } else {
            warn!(status = %status, "unexpected response, retrying");
        }

        if backoff_wait(attempt, cancel).await {
            return Ok(Outcome::Cancelled);
        }
        attempt += 1;
    }
}

enum Written {
    Done,
    Cancelled,
    Lost(reqwest::Error),
}

async fn write_body(
    mut response: reqwest::Response,
    target: &Path,
    start: u64,
    inbox: &Inbox,
    cancel: &CancelFlag,
) -> anyhow::Result<Written> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(target)
        .await
        .with_context(|| format!("open {}", target.display()))?;

    let mut written = start;
    loop {
        if cancel.is_set() {
            return Ok(Written::Cancelled);
        }
        match response.chunk().await {
            Ok(Some(chunk)) => {
                file.write_all(&chunk).await.context("write artifact")?;
                file.flush().await.context("flush artifact")?;
                // Make the byte count on disk trustworthy for a resume after
                // a crash or power loss.
                file.sync_data().await.context("sync artifact")?;
                written += chunk.len() as u64;
                let _ = inbox.send(Event::DownloadProgress { bytes: written });
            }
            Ok(None) => return Ok(Written::Done),
            Err(err) => return Ok(Written::Lost(err)),
        }
    }
}

/// Full-jitter exponential backoff capped at [`BACKOFF_CAP`]. Returns true
/// when the wait was cancelled.
async fn backoff_wait(attempt: u32, cancel: &CancelFlag) -> bool {
    let exp = BACKOFF_BASE_SECS.saturating_mul(1 << attempt.min(6));
    let cap_ms = BACKOFF_CAP.as_millis().min(u128::from(exp) * 1000) as u64;
    let delay = Duration::from_millis(rand::thread_rng().gen_range(0..=cap_ms));
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = cancel.cancelled() => true,
    }
}

async fn purge_stale_artifacts(download_location: &Path, target: &Path) -> std::io::Result<()> {
    let mut entries = fs::read_dir(download_location).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path != target {
            info!(path = %path.display(), "deleting previous download artifact");
            let _ = fs::remove_file(&path).await;
        }
    }
    Ok(())
}
