use crate::options::Options;
use apisix_ingress_core::instrumentation::LogFormat;
use clap::{Parser, ValueEnum};
use getset::{CopyGetters, Getters};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdminTargetError {
    #[error("expected NAME=URL, got {0:?}")]
    MissingName(String),
    #[error("invalid admin API URL {url:?}: {message}")]
    InvalidUrl { url: String, message: String },
}

/// One APISIX control plane to write to, given as `NAME=URL`.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct AdminTarget {
    name: String,
    url: Url,
}

impl FromStr for AdminTarget {
    type Err = AdminTargetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (name, url) = value
            .split_once('=')
            .filter(|(name, _)| !name.trim().is_empty())
            .ok_or_else(|| AdminTargetError::MissingName(value.to_string()))?;
        let url = Url::parse(url.trim()).map_err(|err| AdminTargetError::InvalidUrl {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        Ok(Self {
            name: name.trim().to_string(),
            url,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(format: LogFormatArg) -> Self {
        match format {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Parser, Getters, CopyGetters)]
#[cfg_attr(test, derive(Debug))]
#[command(about = "Synchronizes Kubernetes state into APISIX control planes", long_about = None)]
pub struct Cli {
    #[getset(get = "pub")]
    #[arg(
        env = "APISIX_ADMIN_URLS",
        long = "admin-url",
        value_delimiter = ',',
        required = true
    )]
    admin_targets: Vec<AdminTarget>,

    #[getset(get = "pub")]
    #[arg(env = "APISIX_ADMIN_KEY", long = "admin-key", default_value = "", hide_env_values = true)]
    admin_key: String,

    #[getset(get_copy = "pub")]
    #[arg(env = "APISIX_ADMIN_TIMEOUT_SECONDS", long = "admin-timeout-seconds", default_value = "10")]
    admin_timeout_seconds: u64,

    #[getset(get_copy = "pub")]
    #[arg(env = "LOG_FORMAT", long = "log-format", value_enum, default_value = "text")]
    log_format: LogFormatArg,

    /// Seconds between full resyncs of every watched object; 0 disables resync.
    #[getset(get_copy = "pub")]
    #[arg(env = "RESYNC_SECONDS", long = "resync-seconds", default_value = "21600")]
    resync_seconds: u64,

    /// Write to in-memory control planes instead of the admin API.
    #[getset(get_copy = "pub")]
    #[arg(env = "DRY_RUN", long = "dry-run")]
    dry_run: bool,
}

impl Cli {
    pub fn admin_timeout(&self) -> Duration {
        Duration::from_secs(self.admin_timeout_seconds)
    }

    pub fn options(&self) -> Options {
        Options::default().with_resync_period(Duration::from_secs(self.resync_seconds))
    }
}
