//! Shared data model for the update agent: configuration loading and the
//! AWS IoT Jobs wire protocol (topics, payloads, statuses).

pub mod config;
pub mod jobs;

/// Service name, used for the download sub-directory and broker defaults.
pub const NAME: &str = "ota-agent";
