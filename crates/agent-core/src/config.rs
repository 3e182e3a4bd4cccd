//! Configuration model and validation.
//!
//! All settings live in an optional TOML file with `[service]`, `[broker]`
//! and `[hooks]` sections; the CLI only overrides verbosity and the thing
//! name. The loaded [`Config`] is immutable and handed by reference to every
//! component that needs it.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::NAME;

pub const DEFAULT_BROKER_HOST: &str = "127.0.0.1";
pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_LOG_LEVEL: &str = "warn";
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_RETRIES: u32 = 60;

/// Ports on which the broker accepts TLS client certificates with ALPN.
const TLS_PORTS: [u16; 2] = [443, 8883];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    ReadFile { path: PathBuf, source: io::Error },
    #[error("invalid config file {path}: {source}")]
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("unable to create download location {path}: {source}")]
    CreateDownloadLocation { path: PathBuf, source: io::Error },
    #[error("insufficient permissions to write to download location {path}")]
    DownloadLocationDenied { path: PathBuf },
    #[error("invalid command for {hook} hook: {path}")]
    HookNotExecutable { hook: &'static str, path: PathBuf },
    #[error("cafile, certfile and keyfile must be configured together")]
    IncompleteTlsMaterial,
    #[error("port must be 443 or 8883 for TLS ALPN client certificate authentication")]
    InvalidTlsPort,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub service: ServiceConfig,
    pub broker: BrokerConfig,
    pub hooks: HooksConfig,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
    /// Directory artifacts are downloaded to. Always ends with the service
    /// name so the whole directory can be wiped on uninstall.
    pub download_location: PathBuf,
    /// Telemetry DSN, forwarded to the error reporter when set.
    pub sentry: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub thing_name: String,
    pub client_id: String,
    pub tls: Option<TlsMaterial>,
}

#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub cafile: PathBuf,
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
}

#[derive(Debug, Clone)]
pub struct HooksConfig {
    pub version: Option<PathBuf>,
    pub download: Option<PathBuf>,
    pub ready: Option<PathBuf>,
    pub install: Option<PathBuf>,
    pub restart: Option<PathBuf>,
    pub retry_interval: Duration,
    pub max_retries: u32,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    service: ServiceSection,
    #[serde(default)]
    broker: BrokerSection,
    #[serde(default)]
    hooks: HooksSection,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceSection {
    log_level: Option<String>,
    download_location: Option<PathBuf>,
    sentry: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BrokerSection {
    host: Option<String>,
    port: Option<u16>,
    thing_name: Option<String>,
    client_id: Option<String>,
    cafile: Option<PathBuf>,
    certfile: Option<PathBuf>,
    keyfile: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct HooksSection {
    version: Option<PathBuf>,
    download: Option<PathBuf>,
    ready: Option<PathBuf>,
    install: Option<PathBuf>,
    restart: Option<PathBuf>,
    retry_interval: Option<u64>,
    max_retries: Option<u32>,
}

impl Config {
    /// Loads and validates the configuration. Any error here aborts startup
    /// before the state machine runs.
    pub fn load(
        config_file: Option<&Path>,
        verbose: bool,
        thing_name: Option<&str>,
    ) -> Result<Config, ConfigError> {
        let file = match config_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| {
                    ConfigError::ReadFile {
                        path: path.to_path_buf(),
                        source,
                    }
                })?;
                toml::from_str(&raw).map_err(|source| ConfigError::ParseFile {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => ConfigFile::default(),
        };

        let service = service_config(file.service, verbose)?;
        let broker = broker_config(file.broker, thing_name)?;
        let hooks = hooks_config(file.hooks)?;

        Ok(Config {
            service,
            broker,
            hooks,
        })
    }
}

fn service_config(section: ServiceSection, verbose: bool) -> Result<ServiceConfig, ConfigError> {
    let log_level = if verbose {
        "debug".to_string()
    } else {
        section
            .log_level
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
    };

    let base = section
        .download_location
        .unwrap_or_else(std::env::temp_dir);
    let download_location = base.join(NAME);
    std::fs::create_dir_all(&download_location).map_err(|source| {
        ConfigError::CreateDownloadLocation {
            path: download_location.clone(),
            source,
        }
    })?;
    if !access(&download_location, libc::W_OK | libc::X_OK) {
        return Err(ConfigError::DownloadLocationDenied {
            path: download_location,
        });
    }

    Ok(ServiceConfig {
        log_level,
        download_location,
        sentry: section.sentry,
    })
}

fn broker_config(
    section: BrokerSection,
    thing_name: Option<&str>,
) -> Result<BrokerConfig, ConfigError> {
    let port = section.port.unwrap_or(DEFAULT_BROKER_PORT);

    let tls = match (section.cafile, section.certfile, section.keyfile) {
        (None, None, None) => None,
        (Some(cafile), Some(certfile), Some(keyfile)) => {
            if !TLS_PORTS.contains(&port) {
                return Err(ConfigError::InvalidTlsPort);
            }
            Some(TlsMaterial {
                cafile,
                certfile,
                keyfile,
            })
        }
        _ => return Err(ConfigError::IncompleteTlsMaterial),
    };

    let thing_name = thing_name
        .map(str::to_string)
        .or(section.thing_name)
        .or_else(hostname)
        .unwrap_or_else(|| NAME.to_string());

    Ok(BrokerConfig {
        host: section
            .host
            .unwrap_or_else(|| DEFAULT_BROKER_HOST.to_string()),
        port,
        thing_name,
        client_id: section.client_id.unwrap_or_else(|| NAME.to_string()),
        tls,
    })
}

fn hooks_config(section: HooksSection) -> Result<HooksConfig, ConfigError> {
    let check = |hook: &'static str, path: Option<PathBuf>| match path {
        Some(path) if !access(&path, libc::X_OK) => {
            Err(ConfigError::HookNotExecutable { hook, path })
        }
        other => Ok(other),
    };

    Ok(HooksConfig {
        version: check("version", section.version)?,
        download: check("download", section.download)?,
        ready: check("ready", section.ready)?,
        install: check("install", section.install)?,
        restart: check("restart", section.restart)?,
        retry_interval: section
            .retry_interval
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_INTERVAL),
        max_retries: section.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
    })
}

fn access(path: &Path, mode: libc::c_int) -> bool {
    let Ok(path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(path.as_ptr(), mode) == 0 }
}

fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|b| *b == 0)?;
    std::str::from_utf8(&buf[..end]).ok().map(str::to_string)
}
