use std::str::FromStr;

pub const SERVER_TOKEN: &str = "SERVER_TOKEN";

pub const INGEST_URL: &str = "INGEST_URL";

/// Base URL of the backend, the ingest path is appended to it.
pub const SERVER_URL: &str = "SERVER_URL";

/// Older name for [`SERVER_URL`], still written by installers.
pub const BASE_URL: &str = "BASE_URL";

pub const AGENT_CONFIG: &str = "AGENT_CONFIG";

pub const AGENT_INTERVAL: &str = "AGENT_INTERVAL";

pub const AGENT_MAX_ATTEMPTS: &str = "AGENT_MAX_ATTEMPTS";

pub const AGENT_REQUEST_TIMEOUT: &str = "AGENT_REQUEST_TIMEOUT";

pub const AGENT_PING_HOST: &str = "AGENT_PING_HOST";

/// `false` skips the cloud metadata lookups at startup.
pub const AGENT_CLOUD_DETECTION: &str = "AGENT_CLOUD_DETECTION";

pub const AGENT_LOG: &str = "AGENT_LOG";

/// Reads a variable from the process environment.
pub fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Returns the trimmed value, or `None` if it is blank.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parses an optional setting, handing back the raw text on failure.
pub fn parse_setting<T: FromStr>(value: Option<String>) -> Result<Option<T>, String> {
    match non_blank(value) {
        Some(raw) => raw.parse().map(Some).map_err(|_| raw),
        None => Ok(None),
    }
}
