//! Process settings.
//!
//! Loaded once at startup: an optional TOML file named by `NB_CONFIG`,
//! then `NB_*` environment variables on top (the legacy `LF_*` prefix is
//! accepted when the `NB_*` variable is absent).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_PREFIX: &str = "NB_";
pub const LEGACY_ENV_PREFIX: &str = "LF_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid value for {name}: {value:?}")]
    InvalidVar { name: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding the embedded database.
    pub data_dir: PathBuf,
    pub cluster_file: Option<PathBuf>,
    /// Where project notebooks live on the agents.
    pub base_path: PathBuf,
    /// Where executed notebooks are written.
    pub output_path: PathBuf,
    /// Image used when a workflow references no runtime.
    pub default_image: String,
    pub heartbeat_ttl_secs: u64,
    pub agent_heartbeat_secs: u64,
    pub control_tick_secs: u64,
    pub scheduler_max_wait_secs: u64,
    /// Extra time granted past a job timeout before its lease lapses.
    pub job_grace_secs: u64,
    pub control_timeout_secs: u64,
    pub dispatcher_workers: usize,
    /// Worker slots of each agent the controller provisions.
    pub agent_workers: usize,
    /// Concurrent blocking provider calls.
    pub provider_pool: usize,
    pub queue_max_depth: Option<u64>,
    pub ssh_public_key: Option<PathBuf>,
    pub docker_uid: u32,
    pub docker_gid: u32,
    pub do_token: Option<String>,
    pub local_provider_dir: Option<PathBuf>,
    pub log_json: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/nbgrid"),
            cluster_file: None,
            base_path: PathBuf::from("/var/lib/nbgrid/workflows"),
            output_path: PathBuf::from("/var/lib/nbgrid/outputs"),
            default_image: "nbgrid/runtime:latest".to_string(),
            heartbeat_ttl_secs: 240,
            agent_heartbeat_secs: 30,
            control_tick_secs: 60,
            scheduler_max_wait_secs: 5,
            job_grace_secs: 30,
            control_timeout_secs: 60,
            dispatcher_workers: 2,
            agent_workers: 1,
            provider_pool: 4,
            queue_max_depth: None,
            ssh_public_key: None,
            docker_uid: 1000,
            docker_gid: 1000,
            do_token: None,
            local_provider_dir: None,
            log_json: false,
        }
    }
}

impl Settings {
    /// Load from `NB_CONFIG` (if set) and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .or_else(|| lookup(&format!("{LEGACY_ENV_PREFIX}{name}")))
        };

        let mut settings = match var("CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };

        if let Some(v) = var("DATA_DIR") {
            settings.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("CLUSTER_FILE") {
            settings.cluster_file = Some(PathBuf::from(v));
        }
        if let Some(v) = var("BASE_PATH") {
            settings.base_path = PathBuf::from(v);
        }
        if let Some(v) = var("OUTPUT_PATH") {
            settings.output_path = PathBuf::from(v);
        }
        if let Some(v) = var("DEFAULT_IMAGE") {
            settings.default_image = v;
        }
        parse_into(&var, "HEARTBEAT_TTL", &mut settings.heartbeat_ttl_secs)?;
        parse_into(&var, "AGENT_HEARTBEAT", &mut settings.agent_heartbeat_secs)?;
        parse_into(&var, "CONTROL_TICK", &mut settings.control_tick_secs)?;
        parse_into(&var, "SCHEDULER_MAX_WAIT", &mut settings.scheduler_max_wait_secs)?;
        parse_into(&var, "JOB_GRACE", &mut settings.job_grace_secs)?;
        parse_into(&var, "CONTROL_TIMEOUT", &mut settings.control_timeout_secs)?;
        parse_into(&var, "DISPATCHER_WORKERS", &mut settings.dispatcher_workers)?;
        parse_into(&var, "AGENT_WORKERS", &mut settings.agent_workers)?;
        parse_into(&var, "PROVIDER_POOL", &mut settings.provider_pool)?;
        parse_into(&var, "DOCKER_UID", &mut settings.docker_uid)?;
        parse_into(&var, "DOCKER_GID", &mut settings.docker_gid)?;
        if let Some(v) = var("QUEUE_MAX_DEPTH") {
            settings.queue_max_depth = Some(parse_var("QUEUE_MAX_DEPTH", &v)?);
        }
        if let Some(v) = var("SSH_PUBLIC_KEY") {
            settings.ssh_public_key = Some(PathBuf::from(v));
        }
        if let Some(v) = var("DO_TOKEN") {
            settings.do_token = Some(v);
        }
        if let Some(v) = var("LOCAL_PROVIDER_DIR") {
            settings.local_provider_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("LOG_JSON") {
            settings.log_json = v == "1" || v.eq_ignore_ascii_case("true");
        }

        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("nbgrid.redb")
    }

    pub fn local_provider_root(&self) -> PathBuf {
        self.local_provider_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("local-machines"))
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    pub fn agent_heartbeat(&self) -> Duration {
        Duration::from_secs(self.agent_heartbeat_secs)
    }

    pub fn control_tick(&self) -> Duration {
        Duration::from_secs(self.control_tick_secs)
    }

    pub fn scheduler_max_wait(&self) -> Duration {
        Duration::from_secs(self.scheduler_max_wait_secs)
    }

    pub fn job_grace(&self) -> Duration {
        Duration::from_secs(self.job_grace_secs)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidVar {
        name: format!("{ENV_PREFIX}{name}"),
        value: value.to_string(),
    })
}

fn parse_into<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(v) = var(name) {
        *target = parse_var(name, &v)?;
    }
    Ok(())
}
