use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

use crate::delivery::RetryPolicy;
use crate::util::{self, non_blank, parse_setting};

pub const DEFAULT_BASE_URL: &str = "https://www.montime.io";

pub const INGEST_PATH: &str = "/api/metrics/ingest";

pub const DEFAULT_CONFIG_FILE: &str = "config.json";

pub const DEFAULT_PING_HOST: &str = "8.8.8.8";

/// Upper bound for `AGENT_MAX_ATTEMPTS`, keeps a failing tick to minutes.
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

/// Errors that prevent the agent from starting.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{} is not set and no api_key was found in the config file", util::SERVER_TOKEN)]
    MissingToken,

    #[error("invalid ingest URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid value `{value}` for {key}: {reason}")]
    InvalidSetting {
        key: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Bearer token identifying this host to the backend.
///
/// The value never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerToken(String);

impl ServerToken {
    pub fn parse(value: impl Into<String>) -> Result<Self, ConfigError> {
        non_blank(Some(value.into()))
            .map(ServerToken)
            .ok_or(ConfigError::MissingToken)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ServerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServerToken(***)")
    }
}

#[derive(Debug, Clone)]
pub struct Credential {
    pub token: ServerToken,
    pub ingest_url: Url,
}

/// Optional JSON file written by the installer next to the agent.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct FileConfig {
    pub api_key: Option<String>,
    pub ingest_url: Option<String>,
    pub base_url: Option<String>,
    pub interval: Option<u64>,
}

pub fn read_config_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let file_content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str::<FileConfig>(&file_content)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
        .inspect(|config| {
            trace!(
                has_api_key = config.api_key.is_some(),
                "loaded config file {}",
                path.display()
            )
        })
}

/// Values given on the command line; they win over the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config_file: Option<PathBuf>,
    pub interval_secs: Option<u64>,
}

/// Immutable agent configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub credential: Credential,
    pub interval: Duration,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub cpu_window: Duration,
    /// Host probed for the connectivity status, `None` disables the probe.
    pub ping_host: Option<String>,
    /// Query cloud metadata services once at startup
    pub detect_cloud: bool,
}

fn default_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_cpu_window() -> Duration {
    Duration::from_secs(1)
}

impl AgentConfig {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            interval: default_interval(),
            retry: RetryPolicy::default(),
            request_timeout: default_request_timeout(),
            cpu_window: default_cpu_window(),
            ping_host: Some(DEFAULT_PING_HOST.to_string()),
            detect_cloud: true,
        }
    }

    /// Resolves the configuration from the process environment.
    pub fn load(overrides: &Overrides) -> Result<Self, ConfigError> {
        Self::from_lookup(util::env_lookup, overrides)
    }

    /// Resolves the configuration from an arbitrary variable source.
    ///
    /// Precedence: command line, environment, config file, defaults.
    pub fn from_lookup<F>(lookup: F, overrides: &Overrides) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = Self::resolve_file(&lookup, overrides)?;

        let token = non_blank(lookup(util::SERVER_TOKEN))
            .or_else(|| non_blank(file.api_key.clone()))
            .map(ServerToken)
            .ok_or(ConfigError::MissingToken)?;

        let ingest_url = resolve_ingest_url(&lookup, &file)?;

        let mut config = Self::new(Credential { token, ingest_url });

        let interval_secs = match overrides.interval_secs {
            Some(secs) => Some(secs),
            None => setting(&lookup, util::AGENT_INTERVAL)?.or(file.interval),
        };
        if let Some(secs) = interval_secs {
            if secs == 0 {
                return Err(ConfigError::InvalidSetting {
                    key: util::AGENT_INTERVAL,
                    value: secs.to_string(),
                    reason: "must be at least one second",
                });
            }
            config.interval = Duration::from_secs(secs);
        }

        if let Some(attempts) = setting::<u32, _>(&lookup, util::AGENT_MAX_ATTEMPTS)? {
            if attempts == 0 {
                return Err(ConfigError::InvalidSetting {
                    key: util::AGENT_MAX_ATTEMPTS,
                    value: attempts.to_string(),
                    reason: "must be at least 1",
                });
            }
            if attempts > MAX_ATTEMPTS_LIMIT {
                return Err(ConfigError::InvalidSetting {
                    key: util::AGENT_MAX_ATTEMPTS,
                    value: attempts.to_string(),
                    reason: "must be at most 10",
                });
            }
            config.retry.max_attempts = attempts;
        }

        if let Some(secs) = setting::<u64, _>(&lookup, util::AGENT_REQUEST_TIMEOUT)? {
            if secs == 0 {
                return Err(ConfigError::InvalidSetting {
                    key: util::AGENT_REQUEST_TIMEOUT,
                    value: secs.to_string(),
                    reason: "must be at least one second",
                });
            }
            config.request_timeout = Duration::from_secs(secs);
        }

        let detect_cloud = parse_setting::<bool>(lookup(util::AGENT_CLOUD_DETECTION)).map_err(
            |value| ConfigError::InvalidSetting {
                key: util::AGENT_CLOUD_DETECTION,
                value,
                reason: "expected true or false",
            },
        )?;
        if let Some(detect_cloud) = detect_cloud {
            config.detect_cloud = detect_cloud;
        }

        // present but blank disables the probe
        if let Some(host) = lookup(util::AGENT_PING_HOST) {
            config.ping_host = non_blank(Some(host));
        }

        debug!(
            ingest_url = %config.credential.ingest_url,
            interval_secs = config.interval.as_secs(),
            max_attempts = config.retry.max_attempts,
            "resolved agent configuration"
        );

        Ok(config)
    }

    fn resolve_file<F>(lookup: &F, overrides: &Overrides) -> Result<FileConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = &overrides.config_file {
            return read_config_file(path);
        }
        if let Some(path) = non_blank(lookup(util::AGENT_CONFIG)) {
            return read_config_file(Path::new(&path));
        }

        let default_path = Path::new(DEFAULT_CONFIG_FILE);
        if default_path.is_file() {
            return read_config_file(default_path);
        }

        Ok(FileConfig::default())
    }
}

fn setting<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    parse_setting(lookup(key)).map_err(|value| ConfigError::InvalidSetting {
        key,
        value,
        reason: "expected a non-negative integer",
    })
}

fn resolve_ingest_url<F>(lookup: &F, file: &FileConfig) -> Result<Url, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = non_blank(lookup(util::INGEST_URL)).or_else(|| non_blank(file.ingest_url.clone())) {
        return parse_http_url(&url);
    }

    let base = non_blank(lookup(util::SERVER_URL))
        .or_else(|| non_blank(lookup(util::BASE_URL)))
        .or_else(|| non_blank(file.base_url.clone()))
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

    let url = format!("{}{INGEST_PATH}", base.trim_end_matches('/'));
    parse_http_url(&url)
}

fn parse_http_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme `{scheme}`"),
        }),
    }
}
