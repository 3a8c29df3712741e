use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use soundcron_core::{blacklist::Blacklist, config::SoundCronConfig, dispatch::Dispatcher};
use soundcron_discord::DiscordAdapter;
use soundcron_queue::{
    default_consumer_name, PrintDispatcher, RedisBlacklist, RedisJobReceiver,
    RedisStreamDispatcher,
};
use soundcron_scheduler::{Poller, ScheduleStore};
use soundcron_worker::{
    BlobSource, DeliveryConfig, DeliveryDeps, DryRunBlobs, DryRunVoice, HttpBlobSource,
    VoiceConnector, Worker,
};

mod cli;
mod commands;

use cli::{Cli, Command};

/// How long background tasks get to wind down after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "soundcron=info,soundcron_scheduler=info,soundcron_queue=info,\
                 soundcron_worker=info,soundcron_discord=info,songbird=warn"
                    .into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config = SoundCronConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        SoundCronConfig::default()
    });

    match cli.command {
        Command::Bot { dry_run } => run_bot(config, dry_run).await,
        Command::Worker { dry_run } => run_worker(config, dry_run).await,
        Command::Add {
            guild_id,
            name,
            cron,
            file_size,
        } => commands::add(&config, &guild_id, &name, &cron, file_size).await,
        Command::List { guild_id } => commands::list(&config, &guild_id).await,
        Command::Delete { id } => commands::delete(&config, &id).await,
    }
}

/// Poller process: Discord cache for channel occupancy, Redis (or the log)
/// for dispatch.
async fn run_bot(config: SoundCronConfig, dry_run: bool) -> anyhow::Result<()> {
    let token = config.require_bot_token()?;
    let store = Arc::new(open_store(&config)?);

    let dispatcher: Arc<dyn Dispatcher> = if dry_run {
        info!("dry run: jobs will be logged, not enqueued");
        Arc::new(PrintDispatcher)
    } else {
        let client = redis::Client::open(config.redis.url.as_str())?;
        Arc::new(
            RedisStreamDispatcher::connect(&client, &config.redis.stream, &config.redis.group)
                .await?,
        )
    };

    let adapter = DiscordAdapter::new(token);
    let poller = Poller::new(
        store,
        Arc::new(adapter.membership()),
        dispatcher,
        Duration::from_secs(config.scheduler.poll_interval_secs),
        Duration::from_secs(config.scheduler.lookahead_secs),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = vec![
        tokio::spawn(adapter.run(shutdown_rx.clone())),
        tokio::spawn(poller.run(shutdown_rx)),
    ];
    info!("soundcron bot started");

    wait_for_shutdown(shutdown_tx, tasks).await
}

/// Worker process: Redis consumer group in, Discord voice out.
async fn run_worker(config: SoundCronConfig, dry_run: bool) -> anyhow::Result<()> {
    let client = redis::Client::open(config.redis.url.as_str())?;
    let consumer = config
        .worker
        .consumer
        .clone()
        .unwrap_or_else(default_consumer_name);
    let receiver = RedisJobReceiver::connect(
        &client,
        &config.redis.stream,
        &config.redis.group,
        &consumer,
        config.redis.read_count,
    )
    .await?;
    let blacklist: Arc<dyn Blacklist> = Arc::new(
        RedisBlacklist::connect(&client, commands::blacklist_ttl(&config)).await?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let (blobs, voice): (Arc<dyn BlobSource>, Arc<dyn VoiceConnector>) = if dry_run {
        info!("dry run: no audio fetch, no voice connection");
        (Arc::new(DryRunBlobs), Arc::new(DryRunVoice))
    } else {
        let adapter = DiscordAdapter::new(config.require_bot_token()?);
        let voice = adapter.voice(
            config.worker.frame_buffer,
            Duration::from_secs(config.worker.drain_timeout_secs),
        );
        tasks.push(tokio::spawn(adapter.run(shutdown_rx.clone())));
        (
            Arc::new(HttpBlobSource::new(config.blob.base_url.clone())),
            Arc::new(voice),
        )
    };

    let worker = Worker::new(
        receiver,
        DeliveryDeps {
            blacklist,
            blobs,
            voice,
        },
        DeliveryConfig::from(&config.worker),
    );
    tasks.push(tokio::spawn(worker.run(shutdown_rx)));
    info!(%consumer, "soundcron worker started");

    wait_for_shutdown(shutdown_tx, tasks).await
}

async fn wait_for_shutdown(
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("background task ended abnormally: {e}"),
            Err(_) => warn!("background task did not stop within {SHUTDOWN_GRACE:?}"),
        }
    }
    Ok(())
}

/// Open the SQLite schedule store, creating its directory if needed.
pub(crate) fn open_store(config: &SoundCronConfig) -> anyhow::Result<ScheduleStore> {
    let path = &config.database.path;
    ensure_parent_dir(path);
    info!(%path, "opening SQLite database");
    Ok(ScheduleStore::open(
        path,
        config.scheduler.occurrences_per_refresh,
    )?)
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
