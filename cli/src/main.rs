//! roundabout CLI - fetch URLs through request promises and manage the cache.
//!
//! ```text
//! roundabout fetch <url> [--field name] [--cached | --progressive] [--offline]
//! roundabout cache size | clear | remove <identifier>
//! ```
//!
//! Payloads go to stdout. Logs go to stderr, or to `[logging] file` when the
//! config sets one.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use roundabout_cache::{CacheManager, FileSystemCacheManager};
use roundabout_config::{ResolvedConfig, RoundaboutConfig};
use roundabout_core::{
    Error, JsonFieldPostProcessor, JsonPostProcessor, Promise, Utf8PostProcessor, WorkQueue,
};
use roundabout_request::{
    HttpTransport, ManualConnectivity, OfflineBehavior, Request, UrlRequestBuilder,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use url::Url;

#[derive(Parser)]
#[command(name = "roundabout")]
#[command(about = "Lazy, cache-aware HTTP fetches", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a URL and print the payload
    Fetch {
        url: Url,
        /// Print a single top-level field of a JSON object payload
        #[arg(long)]
        field: Option<String>,
        /// Only read the cached copy
        #[arg(long, conflicts_with = "progressive")]
        cached: bool,
        /// Print the cached copy, then the network copy
        #[arg(long)]
        progressive: bool,
        /// Behave as if the network were unreachable
        #[arg(long)]
        offline: bool,
        /// Override the configured offline behavior
        #[arg(long, value_enum)]
        offline_behavior: Option<OfflineArg>,
        /// Fail with "unchanged" when the server copy matches the cache
        #[arg(long)]
        fail_if_unchanged: bool,
    },
    /// Inspect or clear the response cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Print the cache size and entry count
    Size,
    /// Remove every cached entry
    Clear,
    /// Remove one entry
    Remove { identifier: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum OfflineArg {
    Fail,
    UseCache,
}

impl From<OfflineArg> for OfflineBehavior {
    fn from(arg: OfflineArg) -> Self {
        match arg {
            OfflineArg::Fail => OfflineBehavior::Fail,
            OfflineArg::UseCache => OfflineBehavior::UseCache,
        }
    }
}

fn init_tracing(config: &ResolvedConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| match &config.log_filter {
            Some(filter) => EnvFilter::try_new(filter),
            None => EnvFilter::try_new("info"),
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(path) = &config.log_file {
        match open_log_file(path) {
            Ok(file) => {
                tracing_subscriber::registry()
                    .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                    .with(env_filter)
                    .init();
                tracing::debug!(path = %path.display(), "Logging initialized");
                return;
            }
            Err(e) => eprintln!("Failed to open log file {}: {e}", path.display()),
        }
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn open_log_file(path: &Path) -> std::io::Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn load_config(path: Option<&Path>) -> Result<ResolvedConfig> {
    let config = match path {
        Some(path) => RoundaboutConfig::load_from(path)?,
        None => RoundaboutConfig::load()?.unwrap_or_default(),
    };
    Ok(ResolvedConfig::from_config(&config))
}

fn open_cache(config: &ResolvedConfig) -> Result<FileSystemCacheManager> {
    FileSystemCacheManager::with_max_size(&config.cache_dir, config.max_cache_size)
        .with_context(|| format!("opening cache at {}", config.cache_dir.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Fetch {
            url,
            field,
            cached,
            progressive,
            offline,
            offline_behavior,
            fail_if_unchanged,
        } => {
            let options = FetchOptions {
                mode: if cached {
                    FetchMode::Cached
                } else if progressive {
                    FetchMode::Progressive
                } else {
                    FetchMode::Network
                },
                offline,
                offline_behavior: offline_behavior.map_or(config.offline_behavior, Into::into),
                cancel_when_unchanged: fail_if_unchanged || config.cancel_when_unchanged,
            };
            fetch(&config, url, field, &options)
        }
        Commands::Cache { action } => cache_command(&config, &action),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    Network,
    Cached,
    Progressive,
}

struct FetchOptions {
    mode: FetchMode,
    offline: bool,
    offline_behavior: OfflineBehavior,
    cancel_when_unchanged: bool,
}

fn fetch(
    config: &ResolvedConfig,
    url: Url,
    field: Option<String>,
    options: &FetchOptions,
) -> Result<()> {
    let cache = Arc::new(open_cache(config)?);
    let transport = Arc::new(HttpTransport::new(&config.transport_settings())?);
    let queue = WorkQueue::new("roundabout-cli", config.workers);

    let builder = UrlRequestBuilder::new(Request::get(url), transport)
        .cache_manager(cache)
        .connectivity(Arc::new(ManualConnectivity::with_reachable(!options.offline)))
        .offline_behavior(options.offline_behavior)
        .cancel_when_remote_data_unchanged(options.cancel_when_unchanged)
        .activity_logging(config.activity_logging)
        .executor(Arc::new(queue));

    match field {
        Some(field) => {
            let builder = builder
                .post_processor(JsonPostProcessor)
                .post_processor(JsonFieldPostProcessor::new(field));
            run(builder, options.mode, |value: serde_json::Value| match value {
                serde_json::Value::String(text) => text,
                other => other.to_string(),
            })
        }
        None => run(
            builder.post_processor(Utf8PostProcessor),
            options.mode,
            |text: String| text,
        ),
    }
}

fn run<T: Clone + Send + 'static>(
    builder: UrlRequestBuilder,
    mode: FetchMode,
    render: impl Fn(T) -> String,
) -> Result<()> {
    let promise = builder.build::<T>()?;
    match mode {
        FetchMode::Cached => print_outcome(&promise.cached_data(), &render),
        FetchMode::Network => print_outcome(promise.promise(), &render),
        FetchMode::Progressive => {
            let parts = promise.progressive();
            if let Some(first) = parts.first() {
                match first.wait() {
                    Ok(value) => println!("{}", render(value)),
                    Err(Error::CacheMiss { .. }) => {}
                    Err(e) => tracing::warn!("Cached copy unavailable: {e}"),
                }
            }
            print_outcome(parts.second(), &render)
        }
    }
}

fn print_outcome<T: Clone + Send + 'static>(
    promise: &Promise<T>,
    render: &impl Fn(T) -> String,
) -> Result<()> {
    match promise.wait() {
        Ok(value) => {
            println!("{}", render(value));
            Ok(())
        }
        Err(Error::Unchanged) => {
            eprintln!("unchanged");
            Ok(())
        }
        Err(e) => bail!("{}: {e}", promise.name()),
    }
}

fn cache_command(config: &ResolvedConfig, action: &CacheAction) -> Result<()> {
    let cache = open_cache(config)?;
    match action {
        CacheAction::Size => {
            println!(
                "{} bytes in {} entries ({})",
                cache.cache_size(),
                cache.entry_count(),
                cache.dir().display()
            );
        }
        CacheAction::Clear => {
            cache.remove_all_cache().context("clearing cache")?;
            tracing::info!(dir = %cache.dir().display(), "Cache cleared");
        }
        CacheAction::Remove { identifier } => {
            cache
                .remove_cache_for_identifier(identifier)
                .with_context(|| format!("removing {identifier}"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_fetch_flags() {
        let cli = Cli::try_parse_from([
            "roundabout",
            "fetch",
            "https://example.com/a",
            "--field",
            "name",
            "--offline",
            "--offline-behavior",
            "use-cache",
        ])
        .unwrap();
        match cli.command {
            Commands::Fetch {
                url,
                field,
                offline,
                offline_behavior,
                ..
            } => {
                assert_eq!(url.as_str(), "https://example.com/a");
                assert_eq!(field.as_deref(), Some("name"));
                assert!(offline);
                assert!(matches!(offline_behavior, Some(OfflineArg::UseCache)));
            }
            Commands::Cache { .. } => panic!("expected fetch"),
        }
    }

    #[test]
    fn cached_and_progressive_conflict() {
        assert!(
            Cli::try_parse_from([
                "roundabout",
                "fetch",
                "https://example.com/",
                "--cached",
                "--progressive",
            ])
            .is_err()
        );
    }

    #[test]
    fn cache_subcommands() {
        let cli = Cli::try_parse_from(["roundabout", "cache", "remove", "id-1"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Cache {
                action: CacheAction::Remove { ref identifier }
            } if identifier == "id-1"
        ));
    }
}
