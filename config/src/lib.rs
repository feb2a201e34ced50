//! Configuration for roundabout.
//!
//! The file lives at `~/.roundabout/config.toml`, or wherever
//! `ROUNDABOUT_CONFIG` points. Every section and field is optional:
//!
//! ```toml
//! [cache]
//! dir = "${XDG_CACHE_HOME}/roundabout"
//! max_size_bytes = 31457280
//!
//! [http]
//! timeout_secs = 20
//! user_agent = "my-app/1.0"
//!
//! [request]
//! offline_behavior = "use_cache"
//! cancel_when_unchanged = false
//! activity_logging = true
//!
//! [queue]
//! workers = 4
//!
//! [logging]
//! filter = "roundabout=debug"
//! file = "~/.roundabout/roundabout.log"
//! ```
//!
//! [`ResolvedConfig`] fills in everything the file leaves out.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use roundabout_cache::DEFAULT_MAX_CACHE_SIZE;
use roundabout_request::{DEFAULT_TIMEOUT, OfflineBehavior, TransportSettings};
use serde::Deserialize;
use thiserror::Error;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "ROUNDABOUT_CONFIG";

pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoundaboutConfig {
    pub cache: Option<CacheConfig>,
    pub http: Option<HttpConfig>,
    pub request: Option<RequestConfig>,
    pub queue: Option<QueueConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CacheConfig {
    /// Cache directory. `~` and `${VAR}` are expanded.
    pub dir: Option<String>,
    pub max_size_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HttpConfig {
    pub timeout_secs: Option<u64>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RequestConfig {
    pub offline_behavior: Option<OfflineBehavior>,
    #[serde(default)]
    pub cancel_when_unchanged: bool,
    #[serde(default)]
    pub activity_logging: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueueConfig {
    /// Worker threads in the common work queue.
    pub workers: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directives, used when `RUST_LOG` is unset.
    pub filter: Option<String>,
    /// Append logs here instead of stderr.
    pub file: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

impl RoundaboutConfig {
    /// Load the config file, if there is one.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read config at {:?}: {}", path, source);
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Self::parse(path, &content)
    }

    /// Parse `content`, attributing errors to `path`.
    pub fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| {
            tracing::warn!("Failed to parse config at {:?}: {}", path, source);
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    pub fn path() -> Option<PathBuf> {
        config_path()
    }
}

/// `$ROUNDABOUT_CONFIG`, else `~/.roundabout/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_ENV).filter(|value| !value.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".roundabout").join("config.toml"))
}

/// Settings with every default applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub cache_dir: PathBuf,
    pub max_cache_size: u64,
    pub timeout: Duration,
    pub user_agent: String,
    pub offline_behavior: OfflineBehavior,
    pub cancel_when_unchanged: bool,
    pub activity_logging: bool,
    pub workers: usize,
    pub log_filter: Option<String>,
    pub log_file: Option<PathBuf>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self::from_config(&RoundaboutConfig::default())
    }
}

impl ResolvedConfig {
    #[must_use]
    pub fn from_config(config: &RoundaboutConfig) -> Self {
        let cache = config.cache.as_ref();
        let http = config.http.as_ref();
        let request = config.request.as_ref();
        let logging = config.logging.as_ref();

        let cache_dir = cache
            .and_then(|c| c.dir.as_deref())
            .map(expand_path)
            .unwrap_or_else(default_cache_dir);
        let workers = config
            .queue
            .as_ref()
            .and_then(|q| q.workers)
            .filter(|&workers| workers > 0)
            .unwrap_or(DEFAULT_WORKERS);

        Self {
            cache_dir,
            max_cache_size: cache
                .and_then(|c| c.max_size_bytes)
                .unwrap_or(DEFAULT_MAX_CACHE_SIZE),
            timeout: http
                .and_then(|h| h.timeout_secs)
                .map_or(DEFAULT_TIMEOUT, Duration::from_secs),
            user_agent: http
                .and_then(|h| h.user_agent.clone())
                .unwrap_or_else(|| TransportSettings::default().user_agent),
            offline_behavior: request
                .and_then(|r| r.offline_behavior)
                .unwrap_or_default(),
            cancel_when_unchanged: request.is_some_and(|r| r.cancel_when_unchanged),
            activity_logging: request.is_some_and(|r| r.activity_logging),
            workers,
            log_filter: logging.and_then(|l| l.filter.clone()),
            log_file: logging.and_then(|l| l.file.as_deref()).map(expand_path),
        }
    }

    /// Transport options derived from the HTTP settings.
    #[must_use]
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            user_agent: self.user_agent.clone(),
            timeout: self.timeout,
            ..TransportSettings::default()
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(env::temp_dir)
        .join("roundabout")
}

/// Expand `${VAR}` references and a leading `~`. Unset variables expand to
/// nothing.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let name = &rest[start + 2..start + 2 + len];
        if !name.is_empty() {
            out.push_str(&env::var(name).unwrap_or_default());
        }
        rest = &rest[start + 3 + len..];
    }
    out.push_str(rest);
    out
}

fn expand_path(value: &str) -> PathBuf {
    let expanded = expand_env_vars(value);
    match expanded.strip_prefix('~') {
        Some(tail) if tail.is_empty() || tail.starts_with('/') => match dirs::home_dir() {
            Some(home) => home.join(tail.trim_start_matches('/')),
            None => PathBuf::from(expanded),
        },
        _ => PathBuf::from(expanded),
    }
}
