mod cli;
mod shutdown;

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info};

use ota_agent_core::config::Config;
use ota_agent_engine::events::Event;
use ota_agent_engine::mqtt::{self, BusHandle};
use ota_agent_engine::{Context, Machine};

use crate::cli::Cli;
use crate::shutdown::{ShutdownController, spawn_signal_handler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Any configuration problem aborts here, before the broker connection
    // or the state machine exist.
    let cfg = Config::load(
        cli.config_file.as_deref(),
        cli.verbose,
        cli.thing_name.as_deref(),
    )?;
    init_logging(&cfg.service.log_level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        thing_name = %cfg.broker.thing_name,
        "starting"
    );
    if cfg.service.sentry.is_some() {
        debug!("telemetry DSN configured");
    }

    let transport = mqtt::transport(&cfg.broker)?;

    let cfg = Arc::new(cfg);
    let (inbox, mut events) = mpsc::unbounded_channel::<Event>();
    let (bus, bus_commands) = BusHandle::channel();
    let bus_task = tokio::spawn(mqtt::run_bus(
        cfg.broker.clone(),
        transport,
        bus_commands,
        inbox.clone(),
    ));

    spawn_signal_handler(Arc::new(ShutdownController::new()), inbox.clone());

    let mut machine = Machine::new(Context {
        cfg,
        bus,
        inbox,
    });
    machine.start();

    while let Some(event) = events.recv().await {
        debug!(event = ?event.name(), "inbox event");
        if machine.dispatch(event).is_break() {
            break;
        }
    }

    bus_task.abort();
    Ok(())
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .with_context(|| format!("invalid log level: {level}"))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}
