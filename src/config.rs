use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::CoordError;
use crate::util::home_dir;

/// Backoff used by a client that cannot reach the coordination server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// 0 = retry forever.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            max_attempts: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoordConfig {
    /// Fixed part of the endpoint name; the owner pid is appended.
    pub endpoint_prefix: String,
    /// Directory holding Unix socket endpoints. Unused on Windows.
    pub socket_dir: PathBuf,
    /// Class name of the singleton window whose owner becomes the server.
    pub window_class: String,
    /// Owner pid used where no singleton window can be queried.
    pub owner_pid: Option<u32>,
    pub retry: RetryPolicy,
    pub log_filter: String,
}

impl Default for CoordConfig {
    fn default() -> Self {
        CoordConfig {
            endpoint_prefix: "tabcoord".to_string(),
            socket_dir: env::temp_dir(),
            window_class: "Shell_TrayWnd".to_string(),
            owner_pid: None,
            retry: RetryPolicy::default(),
            log_filter: "info".to_string(),
        }
    }
}

/// Load the first config file found in the home directory, then apply
/// environment overrides.
pub fn load_config() -> CoordConfig {
    let mut cfg = CoordConfig::default();
    if let Some(home) = home_dir() {
        let paths = [
            home.join(".tabcoord.conf"),
            home.join(".config").join("tabcoord").join("tabcoord.conf"),
        ];
        for path in paths.iter() {
            if let Ok(content) = std::fs::read_to_string(path) {
                debug!(path = %path.display(), "loading config");
                parse_config_content(&mut cfg, &content);
                break;
            }
        }
    }
    apply_env_overrides(&mut cfg);
    cfg
}

pub fn parse_config_content(cfg: &mut CoordConfig, content: &str) {
    for (lineno, line) in content.lines().enumerate() {
        if let Err(e) = parse_config_line(cfg, line) {
            warn!(line = lineno + 1, error = %e, "skipping config line");
        }
    }
}

/// Parse one `set <key> <value>` line. Blank lines and `#` comments are accepted.
pub fn parse_config_line(cfg: &mut CoordConfig, line: &str) -> Result<(), CoordError> {
    let l = line.trim();
    if l.is_empty() || l.starts_with('#') {
        return Ok(());
    }
    let rest = l
        .strip_prefix("set-option ")
        .or_else(|| l.strip_prefix("set "))
        .ok_or_else(|| CoordError::Config {
            key: "<directive>".to_string(),
            value: l.to_string(),
        })?;
    let mut parts = rest.trim().splitn(2, char::is_whitespace);
    let key = parts.next().unwrap_or("");
    let value = parts.next().unwrap_or("").trim().trim_matches('"');
    set_option(cfg, key, value)
}

pub fn set_option(cfg: &mut CoordConfig, key: &str, value: &str) -> Result<(), CoordError> {
    let bad = || CoordError::Config {
        key: key.to_string(),
        value: value.to_string(),
    };
    match key {
        "endpoint-prefix" => {
            if value.is_empty() {
                return Err(bad());
            }
            cfg.endpoint_prefix = value.to_string();
        }
        "socket-dir" => {
            if value.is_empty() {
                return Err(bad());
            }
            cfg.socket_dir = PathBuf::from(value);
        }
        "window-class" => {
            if value.is_empty() {
                return Err(bad());
            }
            cfg.window_class = value.to_string();
        }
        "owner-pid" => {
            cfg.owner_pid = Some(value.parse::<u32>().map_err(|_| bad())?);
        }
        "retry-initial-ms" => {
            let ms = value.parse::<u64>().map_err(|_| bad())?;
            cfg.retry.initial_delay = Duration::from_millis(ms.max(1));
        }
        "retry-max-ms" => {
            let ms = value.parse::<u64>().map_err(|_| bad())?;
            cfg.retry.max_delay = Duration::from_millis(ms.max(1));
        }
        "retry-attempts" => {
            cfg.retry.max_attempts = value.parse::<u32>().map_err(|_| bad())?;
        }
        "log-filter" => {
            cfg.log_filter = value.to_string();
        }
        _ => return Err(bad()),
    }
    Ok(())
}

fn apply_env_overrides(cfg: &mut CoordConfig) {
    let overrides = [
        ("TABCOORD_PREFIX", "endpoint-prefix"),
        ("TABCOORD_SOCKET_DIR", "socket-dir"),
        ("TABCOORD_OWNER_PID", "owner-pid"),
        ("TABCOORD_LOG", "log-filter"),
    ];
    for (var, key) in overrides {
        if let Ok(value) = env::var(var) {
            if let Err(e) = set_option(cfg, key, &value) {
                warn!(var, error = %e, "ignoring environment override");
            }
        }
    }
}
