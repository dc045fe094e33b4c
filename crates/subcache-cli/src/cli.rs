//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use serde_json::Value;
use subcache::caching::{
    CacheKey, CacheRunner, CacheStatus, CachingStrategy, FilesystemStore, SubRequestEvent,
    TaskTrackerDefer,
};
use subcache::config::Config;
use subcache::fetch::{FetchCacheOptions, RequestInit, ResponseBody, ReturnType};
use subcache::metrics;
use subcache::utils::http::create_client;

use crate::logging;

/// Subcache commands.
#[derive(Subcommand)]
enum Command {
    /// Fetch a URL through the cache, and report how each call was served.
    Fetch(FetchArgs),

    /// Print the normalized cache key of a key descriptor.
    Key {
        /// The key descriptor, as JSON. Input that is not valid JSON is used as a plain string.
        descriptor: String,
    },

    /// Remove expired entries from the on-disk store.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StrategyArg {
    NoStore,
    Short,
    Long,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ReturnTypeArg {
    Json,
    Text,
    Bytes,
}

impl From<ReturnTypeArg> for ReturnType {
    fn from(arg: ReturnTypeArg) -> Self {
        match arg {
            ReturnTypeArg::Json => ReturnType::Json,
            ReturnTypeArg::Text => ReturnType::Text,
            ReturnTypeArg::Bytes => ReturnType::Bytes,
        }
    }
}

#[derive(Args)]
struct FetchArgs {
    /// The URL to fetch.
    url: String,

    /// The request method.
    #[arg(long, short = 'X', default_value = "GET")]
    method: String,

    /// Request headers, as `name: value`.
    #[arg(long = "header", short = 'H', value_name = "HEADER")]
    headers: Vec<String>,

    /// The request body.
    #[arg(long, short)]
    data: Option<String>,

    /// The caching preset. `GET` requests default to the configured strategy.
    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,

    /// Overrides the max-age of the strategy, e.g. `30s`.
    #[arg(long, value_parser = humantime::parse_duration)]
    max_age: Option<Duration>,

    /// Overrides the stale-while-revalidate window of the strategy, e.g. `5m`.
    #[arg(long, value_parser = humantime::parse_duration)]
    stale_while_revalidate: Option<Duration>,

    /// How to decode the response body.
    #[arg(long, value_enum, default_value = "json")]
    return_type: ReturnTypeArg,

    /// How often to send the request.
    #[arg(long, default_value_t = 1)]
    repeat: usize,

    /// The pause between repeated requests, e.g. `2s`.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    interval: Duration,

    /// Only print cache decisions, not the response bodies.
    #[arg(long, short)]
    quiet: bool,
}

impl FetchArgs {
    fn request_init(&self) -> Result<RequestInit> {
        let mut init = RequestInit::new(self.method.clone());
        for header in &self.headers {
            let (name, value) = header
                .split_once(':')
                .with_context(|| format!("invalid header `{header}`, expected `name: value`"))?;
            init = init.with_header(name.trim(), value.trim());
        }
        if let Some(ref data) = self.data {
            init = init.with_body(data.clone());
        }
        Ok(init)
    }

    /// The strategy for every call, `None` leaving the choice to the fetch wrapper.
    ///
    /// Duration overrides without `--strategy` apply to the runner's default strategy, which
    /// then caches requests of any method.
    fn strategy(&self, runner: &CacheRunner) -> Option<CachingStrategy> {
        let base = match self.strategy {
            Some(StrategyArg::NoStore) => CachingStrategy::no_store(),
            Some(StrategyArg::Short) => CachingStrategy::short(),
            Some(StrategyArg::Long) => CachingStrategy::long(),
            None if self.max_age.is_none() && self.stale_while_revalidate.is_none() => {
                return None;
            }
            None => runner.default_strategy(),
        };

        let mut strategy = base;
        if let Some(max_age) = self.max_age {
            strategy = strategy.with_max_age(max_age);
        }
        if let Some(swr) = self.stale_while_revalidate {
            strategy = strategy.with_stale_while_revalidate(swr);
        }
        Some(strategy)
    }
}

/// Command line interface parser.
#[derive(Parser)]
#[command(name = "subcache", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded, the runtime is created below.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )?;
    }

    match cli.command {
        Command::Fetch(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to create the runtime")?;
            runtime.block_on(fetch(&config, args))
        }
        Command::Key { descriptor } => print_key(&config, &descriptor),
        Command::Cleanup { dry_run } => cleanup(&config, dry_run),
    }
}

async fn fetch(config: &Config, args: FetchArgs) -> Result<()> {
    let client = create_client(&config.http).context("failed to create the HTTP client")?;
    let store = config
        .cache_store()
        .context("failed to create the cache store")?;
    let defer = TaskTrackerDefer::new();
    let runner = CacheRunner::from_config(config)
        .with_defer(Arc::new(defer.clone()))
        .with_event_sink(Arc::new(report_event));

    let request_init = args.request_init()?;
    let strategy = args.strategy(&runner);

    for attempt in 0..args.repeat {
        if attempt > 0 {
            tokio::time::sleep(args.interval).await;
        }

        let mut options =
            FetchCacheOptions::new(store.clone()).with_return_type(args.return_type.into());
        options.cache = strategy;

        let (body, response) = runner
            .fetch_with_server_cache(&client, &args.url, request_init.clone(), options)
            .await
            .context("request failed")?;

        if !args.quiet {
            println!("{} {}", response.status(), response.status_text());
            print_body(&body)?;
        }
    }

    // Keep the process alive until background writes and revalidations have settled.
    defer.settled().await;
    Ok(())
}

fn report_event(event: SubRequestEvent) {
    let elapsed = event
        .end_time
        .duration_since(event.start_time)
        .unwrap_or_default();
    let status = match event.status {
        CacheStatus::Miss => style(event.status).yellow(),
        CacheStatus::Hit => style(event.status).green(),
        CacheStatus::Stale => style(event.status).cyan(),
    };
    eprintln!(
        "{status:>5} {} {}",
        style(humantime::format_duration(elapsed)).dim(),
        event.url
    );
}

fn print_body(body: &ResponseBody) -> Result<()> {
    match body {
        ResponseBody::Json(json) => println!("{}", serde_json::to_string_pretty(json)?),
        ResponseBody::Text(text) => println!("{text}"),
        ResponseBody::Bytes(bytes) => println!("<{} bytes>", bytes.len()),
    }
    Ok(())
}

fn print_key(config: &Config, descriptor: &str) -> Result<()> {
    let key = match serde_json::from_str::<Value>(descriptor) {
        Ok(value) => CacheKey::from_descriptor(&value),
        Err(_) => CacheKey::from_descriptor(descriptor),
    }
    .context("invalid key descriptor")?;

    println!("key:      {key}");
    match config.cache_dir {
        Some(ref cache_dir) => {
            let store = FilesystemStore::new(cache_dir).context("failed to open the cache store")?;
            println!("path:     {}", store.entry_path(&key).display());
        }
        None => println!("path:     <in-memory>"),
    }
    println!("url:      {}", key.debug_url());
    println!("metadata: {:?}", key.metadata());
    Ok(())
}

fn cleanup(config: &Config, dry_run: bool) -> Result<()> {
    let cache_dir = config.cache_dir.as_ref().context(
        "no cache_dir configured! Did you provide a path to your config file?",
    )?;
    let store = FilesystemStore::new(cache_dir).context("failed to open the cache store")?;
    let stats = store.cleanup(dry_run)?;

    println!(
        "removed {} files ({} bytes), retained {} files ({} bytes)",
        stats.removed_files, stats.removed_bytes, stats.retained_files, stats.retained_bytes
    );
    Ok(())
}
