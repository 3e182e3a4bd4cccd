use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "ota-agent", version, about = "MQTT-driven update agent for IoT devices")]
pub struct Cli {
    /// Force debug logging, overriding the configured log level.
    #[arg(short = 'v', long, env = "OTA_AGENT_VERBOSE", default_value_t = false)]
    pub verbose: bool,

    /// Path to the TOML configuration file.
    #[arg(short = 'c', long, env = "OTA_AGENT_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Device identity used in the job-control topics.
    #[arg(short = 't', long, env = "OTA_AGENT_THING_NAME")]
    pub thing_name: Option<String>,
}
