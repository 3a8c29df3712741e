use std::sync::{Arc, RwLock};
use std::time::Duration;

use serenity::all::{Context, EventHandler, GatewayIntents, Ready};
use serenity::async_trait;
use serenity::cache::Cache;
use serenity::Client;
use songbird::{SerenityInit, Songbird};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::membership::{CacheMembership, SharedCache};
use crate::voice::SongbirdConnector;

/// Discord gateway connection shared by the poller and the worker.
///
/// The poller reads guild voice occupancy from the cache; the worker joins
/// voice channels through songbird. Both handles stay valid across the
/// reconnects performed by [`DiscordAdapter::run`].
pub struct DiscordAdapter {
    token: String,
    cache: SharedCache,
    songbird: Arc<Songbird>,
}

struct ReadyLogger;

#[async_trait]
impl EventHandler for ReadyLogger {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!(name = %ready.user.name, guilds = ready.guilds.len(), "Discord bot connected");
    }
}

impl DiscordAdapter {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            cache: Arc::new(RwLock::new(None)),
            songbird: Songbird::serenity(),
        }
    }

    pub fn membership(&self) -> CacheMembership {
        CacheMembership::new(Arc::clone(&self.cache))
    }

    pub fn voice(&self, frame_buffer: usize, drain_timeout: Duration) -> SongbirdConnector {
        SongbirdConnector::new(Arc::clone(&self.songbird), frame_buffer, drain_timeout)
    }

    /// Connect and keep reconnecting whenever the gateway drops, until
    /// `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

        loop {
            let mut client = tokio::select! {
                client = self.connect(intents) => client,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let shards = Arc::clone(&client.shard_manager);

            info!("Discord: gateway connecting");
            tokio::select! {
                result = client.start() => match result {
                    Err(e) => warn!("Discord: gateway error ({e}), reconnecting in 5s"),
                    Ok(()) => info!("Discord: gateway stopped cleanly, reconnecting in 5s"),
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Discord: shutting down gateway");
                        shards.shutdown_all().await;
                        break;
                    }
                }
            }

            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    /// Build a client, retrying every 30s until it succeeds.
    async fn connect(&self, intents: GatewayIntents) -> Client {
        loop {
            match self.build_client(intents).await {
                Ok(client) => {
                    self.publish_cache(Arc::clone(&client.cache));
                    return client;
                }
                Err(e) => {
                    error!("Discord: connect failed ({e}), retrying in 30s");
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
            }
        }
    }

    async fn build_client(&self, intents: GatewayIntents) -> Result<Client, serenity::Error> {
        Client::builder(&self.token, intents)
            .event_handler(ReadyLogger)
            .register_songbird_with(Arc::clone(&self.songbird))
            .await
    }

    fn publish_cache(&self, cache: Arc<Cache>) {
        let mut slot = self.cache.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(cache);
    }
}
