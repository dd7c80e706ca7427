use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;

use hzn_bus::{Bus, Delivery, MemBus, MemDelivery};
use hzn_nats::{NatsBucket, NatsBus};
use hzn_service::{
    CommandComputer, ComputeSettings, Computer, HorizonSettings, MessageHandler, ResolverSettings, Resolver, Topics,
    WorkerPool,
    COMPUTE_NAME, RESOLVER_NAME,
};
use hzn_storage::mem::MemBucket;
use hzn_storage::ttl::TtlGcTask;
use hzn_storage::{derive_key, CacheStore, LockStore};
use hzn_types::Location;

#[derive(clap::Parser, Debug)]
#[command(name = "hzn-node", about = "Horizon resolver / compute node")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Answer horizon requests from the cache, delegating misses.
    Resolver,
    /// Compute, cache and publish delegated horizons.
    Compute,
    /// Resolver and compute in one process over in-memory backends. Reads
    /// request JSON lines from stdin and prints results and errors to stdout.
    Standalone,
    /// Print the cached horizon profile for a location.
    Inspect {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
        /// Defaults to the configured horizon radius.
        #[arg(long)]
        radius: Option<u32>,
    },
}

#[derive(Debug, Deserialize)]
struct BusConfig {
    url: String,
    ack_wait_secs: u64,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    cache_bucket: String,
    lock_bucket: String,
    lock_ttl_secs: u64,
    watch_capacity: usize,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    bus: BusConfig,
    storage: StorageConfig,
    topics: Topics,
    horizon: HorizonSettings,
    resolver: ResolverSettings,
    compute: ComputeSettings,
    observability: ObservabilityConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let config: Config = figment
        .merge(Env::prefixed("HZN_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    // stdout carries results in standalone and inspect mode.
    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_writer(std::io::stderr)
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_writer(std::io::stderr)
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    let (stop, stopped) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
        }
        let _ = stop.send(true);
    });

    match cli.command {
        Command::Resolver => run_resolver(config, stopped).await,
        Command::Compute => run_compute(config, stopped).await,
        Command::Standalone => run_standalone(config, stopped).await,
        Command::Inspect { lat, lon, radius } => {
            let radius = radius.unwrap_or(config.horizon.radius);
            inspect(config, Location { lat, lon }, radius).await
        }
    }
}

fn shutdown(mut stopped: watch::Receiver<bool>) -> impl Future<Output = ()> + Send {
    async move {
        let _ = stopped.wait_for(|stop| *stop).await;
    }
}

// ---------------------------------------------------------------------------
// NATS deployment
// ---------------------------------------------------------------------------

struct Nats {
    bus: Arc<NatsBus>,
    cache: CacheStore<NatsBucket>,
    locks: LockStore<NatsBucket>,
}

async fn connect(config: &Config, sender: &str) -> anyhow::Result<Nats> {
    let context = hzn_nats::connect(&config.bus.url).await?;

    let error_topic = config.topics.error_topic(sender);
    hzn_nats::provision_streams(
        &context,
        &[
            config.topics.inbound.as_str(),
            config.topics.compute.as_str(),
            config.topics.results.as_str(),
            error_topic.as_str(),
        ],
    )
    .await
    .context("failed to provision streams")?;

    let cache = hzn_nats::open_bucket(&context, &config.storage.cache_bucket, None)
        .await
        .context("failed to open cache bucket")?;
    let locks = hzn_nats::open_bucket(
        &context,
        &config.storage.lock_bucket,
        Some(Duration::from_secs(config.storage.lock_ttl_secs)),
    )
    .await
    .context("failed to open lock bucket")?;

    Ok(Nats {
        bus: Arc::new(NatsBus::new(context, Duration::from_secs(config.bus.ack_wait_secs))),
        cache: CacheStore::new(Arc::new(cache)),
        locks: LockStore::new(Arc::new(locks)),
    })
}

async fn run_resolver(config: Config, stopped: watch::Receiver<bool>) -> anyhow::Result<()> {
    tracing::info!(url = %config.bus.url, radius = config.horizon.radius, "resolver starting");
    let nats = connect(&config, RESOLVER_NAME).await?;

    let resolver = Arc::new(Resolver::new(
        nats.cache,
        nats.locks,
        Arc::clone(&nats.bus),
        config.topics.clone(),
        config.horizon.radius,
        config.resolver.clone(),
    ));
    WorkerPool::new(nats.bus, config.topics.inbound.clone(), RESOLVER_NAME, config.resolver.concurrency)
        .run(resolver, shutdown(stopped))
        .await?;
    Ok(())
}

async fn run_compute(config: Config, stopped: watch::Receiver<bool>) -> anyhow::Result<()> {
    tracing::info!(
        url = %config.bus.url,
        radius = config.horizon.radius,
        program = %config.compute.program,
        "compute starting"
    );
    let nats = connect(&config, COMPUTE_NAME).await?;

    let horizon = Arc::new(CommandComputer::new(config.compute.program.clone(), config.compute.args.clone()));
    let computer = Arc::new(Computer::new(
        nats.cache,
        nats.locks,
        Arc::clone(&nats.bus),
        horizon,
        config.topics.clone(),
        config.horizon.radius,
        config.compute.clone(),
    ));
    WorkerPool::new(nats.bus, config.topics.compute.clone(), COMPUTE_NAME, config.compute.concurrency)
        .run(computer, shutdown(stopped))
        .await?;
    Ok(())
}

async fn inspect(config: Config, location: Location, radius: u32) -> anyhow::Result<()> {
    let key = derive_key(&location, radius);
    let context = hzn_nats::connect(&config.bus.url).await?;
    let cache = CacheStore::new(Arc::new(hzn_nats::open_bucket(&context, &config.storage.cache_bucket, None).await?));

    let profile = cache
        .get(&key)
        .await?
        .with_context(|| format!("no cached horizon for {key}"))?;
    tracing::info!(%key, bytes = profile.len(), "cached horizon found");

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&profile).await?;
    stdout.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Standalone
// ---------------------------------------------------------------------------

/// Writes every delivery to stdout as one line.
struct Printer;

impl MessageHandler<MemDelivery> for Printer {
    async fn handle(&self, delivery: MemDelivery) {
        let mut stdout = tokio::io::stdout();
        let mut line = delivery.payload().to_vec();
        line.push(b'\n');
        if let Err(e) = stdout.write_all(&line).await {
            tracing::warn!(error = %e, "cannot write to stdout");
        }
        let _ = stdout.flush().await;
        let _ = delivery.ack().await;
    }
}

async fn run_standalone(config: Config, stopped: watch::Receiver<bool>) -> anyhow::Result<()> {
    tracing::info!(radius = config.horizon.radius, program = %config.compute.program, "standalone starting");

    let bus = Arc::new(MemBus::new());
    let cache_bucket = Arc::new(MemBucket::with_options(
        config.storage.cache_bucket.clone(),
        None,
        config.storage.watch_capacity,
    ));
    let lock_bucket = Arc::new(MemBucket::with_options(
        config.storage.lock_bucket.clone(),
        Some(Duration::from_secs(config.storage.lock_ttl_secs)),
        config.storage.watch_capacity,
    ));
    let cache = CacheStore::new(cache_bucket);
    let locks = LockStore::new(Arc::clone(&lock_bucket));
    let gc = tokio::spawn(TtlGcTask::new(lock_bucket).run());

    let resolver = Arc::new(Resolver::new(
        cache.clone(),
        locks.clone(),
        Arc::clone(&bus),
        config.topics.clone(),
        config.horizon.radius,
        config.resolver.clone(),
    ));
    let horizon = Arc::new(CommandComputer::new(config.compute.program.clone(), config.compute.args.clone()));
    let computer = Arc::new(Computer::new(
        cache,
        locks,
        Arc::clone(&bus),
        horizon,
        config.topics.clone(),
        config.horizon.radius,
        config.compute.clone(),
    ));

    let feeder = tokio::spawn(feed_stdin(Arc::clone(&bus), config.topics.inbound.clone()));

    let printer = Arc::new(Printer);
    let errors = format!("{}.*", config.topics.errors);
    let result = tokio::try_join!(
        WorkerPool::new(Arc::clone(&bus), config.topics.inbound.clone(), RESOLVER_NAME, config.resolver.concurrency)
            .run(resolver, shutdown(stopped.clone())),
        WorkerPool::new(Arc::clone(&bus), config.topics.compute.clone(), COMPUTE_NAME, config.compute.concurrency)
            .run(computer, shutdown(stopped.clone())),
        WorkerPool::new(Arc::clone(&bus), config.topics.results.clone(), "standalone-results", 1)
            .run(Arc::clone(&printer), shutdown(stopped.clone())),
        WorkerPool::new(Arc::clone(&bus), errors, "standalone-errors", 1).run(printer, shutdown(stopped)),
    );

    feeder.abort();
    gc.abort();
    result?;
    Ok(())
}

/// Publish each non-empty stdin line as an inbound request.
async fn feed_stdin(bus: Arc<MemBus>, topic: String) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Err(e) = bus.publish(&topic, Bytes::from(line.to_string())).await {
                    tracing::warn!(error = %e, "cannot submit request");
                }
            }
            Ok(None) => {
                tracing::info!("stdin closed, press Ctrl-C to stop");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot read stdin");
                return;
            }
        }
    }
}
