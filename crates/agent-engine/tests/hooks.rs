mod common;

use std::time::Duration;

use ota_agent_engine::events::{Event, HookStatus};
use ota_agent_engine::hooks::{RetryPolicy, run_hook};
use tokio::sync::mpsc;

use crate::common::script;

fn policy(interval: Duration, max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        interval,
        max_retries,
    }
}

async fn next_hook(
    events: &mut mpsc::UnboundedReceiver<Event>,
) -> ota_agent_engine::events::HookEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a hook event")
            .expect("inbox closed");
        if let Event::Hook(hook) = event {
            return hook;
        }
    }
}

#[tokio::test]
async fn streams_output_and_completes_with_the_last_line() {
    let dir = tempfile::tempdir().unwrap();
    let hook = script(dir.path(), "version.sh", "echo 1.0.0\necho   \necho 1.0.1");
    let (inbox, mut events) = mpsc::unbounded_channel();

    let handle = run_hook(&hook, inbox, vec![], policy(Duration::from_secs(1), 3));

    let first = next_hook(&mut events).await;
    assert_eq!(first.status, HookStatus::Output);
    assert_eq!(first.message, "1.0.0");

    // The blank line is skipped.
    let second = next_hook(&mut events).await;
    assert_eq!(second.status, HookStatus::Output);
    assert_eq!(second.message, "1.0.1");

    let done = next_hook(&mut events).await;
    assert_eq!(done.status, HookStatus::Completed);
    assert_eq!(done.message, "1.0.1");
    assert_eq!(done.command, hook);

    handle.join().await;
}

#[tokio::test]
async fn failure_reports_the_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let hook = script(dir.path(), "install.sh", "echo disk full\nexit 5");
    let (inbox, mut events) = mpsc::unbounded_channel();

    run_hook(&hook, inbox, vec![], policy(Duration::from_secs(1), 3));

    let output = next_hook(&mut events).await;
    assert_eq!(output.status, HookStatus::Output);
    assert_eq!(output.message, "disk full");

    let failed = next_hook(&mut events).await;
    assert_eq!(failed.status, HookStatus::Failed);
    assert_eq!(failed.message, "Exit code: 5");
}

#[tokio::test]
async fn hooks_receive_timestamp_retry_counter_and_args() {
    let dir = tempfile::tempdir().unwrap();
    let hook = script(dir.path(), "args.sh", r#"echo "$1|$2|$3|$4""#);
    let (inbox, mut events) = mpsc::unbounded_channel();

    run_hook(
        &hook,
        inbox,
        vec!["meta-blob".to_string(), String::new()],
        policy(Duration::from_secs(1), 3),
    );

    let done = loop {
        let event = next_hook(&mut events).await;
        if event.status == HookStatus::Completed {
            break event;
        }
    };
    let parts: Vec<&str> = done.message.split('|').collect();
    assert_eq!(parts.len(), 4);
    assert!(parts[0].parse::<i64>().unwrap() > 0, "first arg is the start timestamp");
    assert_eq!(parts[1], "0", "second arg is the retry counter");
    assert_eq!(parts[2], "meta-blob");
    assert_eq!(parts[3], "");
}

#[tokio::test]
async fn retry_exhaustion_spawns_exactly_max_retries_times() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("spawns");
    // Appends one line per spawn, then asks for a retry.
    let hook = script(
        dir.path(),
        "retry.sh",
        &format!("echo run >> {}\nexit 3", counter.display()),
    );
    let (inbox, mut events) = mpsc::unbounded_channel();

    let handle = run_hook(&hook, inbox, vec![], policy(Duration::from_millis(50), 4));
    handle.join().await;

    let timed_out = next_hook(&mut events).await;
    assert_eq!(timed_out.status, HookStatus::TimedOut);
    assert_eq!(timed_out.message, "Timeout after 0s");

    let spawns = std::fs::read_to_string(&counter).unwrap().lines().count();
    assert_eq!(spawns, 4);
}

#[tokio::test]
async fn timeout_message_reports_the_total_wait() {
    let dir = tempfile::tempdir().unwrap();
    let hook = script(dir.path(), "retry.sh", "exit 3");
    let (inbox, mut events) = mpsc::unbounded_channel();

    let handle = run_hook(&hook, inbox, vec![], policy(Duration::from_secs(1), 2));
    handle.join().await;

    let timed_out = next_hook(&mut events).await;
    assert_eq!(timed_out.status, HookStatus::TimedOut);
    assert_eq!(timed_out.message, "Timeout after 2s");
}

#[tokio::test]
async fn cancellation_during_the_retry_wait_prevents_the_next_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("spawns");
    let hook = script(
        dir.path(),
        "retry.sh",
        &format!("echo run >> {}\nexit 3", counter.display()),
    );
    let (inbox, mut events) = mpsc::unbounded_channel();

    // A long retry interval: without a working cancel this test would hang.
    let handle = run_hook(&hook, inbox, vec![], policy(Duration::from_secs(3600), 10));

    // Wait for the first attempt to finish so the runner sits in its wait.
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("cancel did not unblock the retry wait");

    let spawns = std::fs::read_to_string(&counter).unwrap().lines().count();
    assert_eq!(spawns, 1);

    // No terminal event either; the runner just stopped.
    while let Ok(event) = events.try_recv() {
        if let Event::Hook(hook) = event {
            assert_eq!(hook.status, HookStatus::Output);
        }
    }
}

#[tokio::test]
async fn cancellation_kills_a_running_child() {
    let dir = tempfile::tempdir().unwrap();
    let hook = script(dir.path(), "slow.sh", "sleep 3600");
    let (inbox, _events) = mpsc::unbounded_channel();

    let handle = run_hook(&hook, inbox, vec![], policy(Duration::from_secs(1), 3));
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("cancel did not kill the child");
}

#[tokio::test]
async fn spawn_failure_is_reported_not_swallowed() {
    let (inbox, mut events) = mpsc::unbounded_channel();
    run_hook(
        std::path::Path::new("/nonexistent/hook"),
        inbox,
        vec![],
        policy(Duration::from_secs(1), 3),
    );

    let failed = next_hook(&mut events).await;
    assert_eq!(failed.status, HookStatus::Failed);
    assert!(failed.message.starts_with("Failed to spawn"));
}

#[tokio::test]
async fn retry_counter_increments_across_attempts() {
    let dir = tempfile::tempdir().unwrap();
    // Succeeds on the third attempt, printing the retry counter it saw.
    let hook = script(
        dir.path(),
        "eventually.sh",
        r#"echo "attempt $2"
if [ "$2" -lt 2 ]; then exit 3; fi"#,
    );
    let (inbox, mut events) = mpsc::unbounded_channel();

    let handle = run_hook(&hook, inbox, vec![], policy(Duration::from_millis(20), 10));
    handle.join().await;

    let mut outputs = Vec::new();
    let mut completed = None;
    while let Ok(event) = events.try_recv() {
        if let Event::Hook(hook) = event {
            match hook.status {
                HookStatus::Output => outputs.push(hook.message),
                HookStatus::Completed => completed = Some(hook.message),
                other => panic!("unexpected hook status {other:?}"),
            }
        }
    }
    assert_eq!(outputs, ["attempt 0", "attempt 1", "attempt 2"]);
    assert_eq!(completed.as_deref(), Some("attempt 2"));
}
