use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use ota_agent_engine::events::{Event, Inbox};
use tokio::signal::unix::{SignalKind, signal};

#[derive(Debug)]
pub struct ShutdownController {
    forced: AtomicU8,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            forced: AtomicU8::new(0),
        }
    }

    pub fn bump_forced(&self) -> u8 {
        self.forced.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// First SIGINT/SIGTERM asks the state machine to wind down; a second one
/// exits immediately.
pub fn spawn_signal_handler(shutdown: Arc<ShutdownController>, inbox: Inbox) {
    tokio::spawn(async move {
        let Ok(mut interrupt) = signal(SignalKind::interrupt()) else {
            return;
        };
        let Ok(mut terminate) = signal(SignalKind::terminate()) else {
            return;
        };

        loop {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
            let n = shutdown.bump_forced();
            if n == 1 {
                let _ = inbox.send(Event::ExitSignal);
            } else {
                std::process::exit(130);
            }
        }
    });
}
