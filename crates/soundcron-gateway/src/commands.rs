//! One-shot management commands against the local schedule store.

use std::sync::Arc;
use std::time::Duration;

use soundcron_core::{blacklist::Blacklist, config::SoundCronConfig};
use soundcron_queue::{MemoryBlacklist, RedisBlacklist};
use soundcron_scheduler::SoundCronService;

use crate::open_store;

pub async fn add(
    config: &SoundCronConfig,
    guild_id: &str,
    name: &str,
    cron: &str,
    file_size: i64,
) -> anyhow::Result<()> {
    let service = service(config, local_blacklist(config))?;
    let soundcron = service.add_soundcron(guild_id, name, cron, file_size).await?;
    println!("created {} ({})", soundcron.id, soundcron.name);
    Ok(())
}

pub async fn list(config: &SoundCronConfig, guild_id: &str) -> anyhow::Result<()> {
    let service = service(config, local_blacklist(config))?;
    let soundcrons = service.list_soundcrons(guild_id).await?;
    if soundcrons.is_empty() {
        println!("no soundcrons in guild {guild_id}");
        return Ok(());
    }
    for sc in soundcrons {
        println!(
            "{}  {:<24} {:<16} {:>9} B  last accessed {}",
            sc.id,
            sc.name,
            sc.cron,
            sc.file_size,
            sc.last_accessed.format("%Y-%m-%d %H:%M UTC")
        );
    }
    Ok(())
}

/// Deleting needs the shared blacklist so workers skip anything already queued.
pub async fn delete(config: &SoundCronConfig, id: &str) -> anyhow::Result<()> {
    let client = redis::Client::open(config.redis.url.as_str())?;
    let blacklist = RedisBlacklist::connect(&client, blacklist_ttl(config)).await?;
    let service = service(config, Arc::new(blacklist))?;
    service.delete_soundcron(id).await?;
    println!("deleted {id}");
    Ok(())
}

fn service(
    config: &SoundCronConfig,
    blacklist: Arc<dyn Blacklist>,
) -> anyhow::Result<SoundCronService> {
    Ok(SoundCronService::new(
        Arc::new(open_store(config)?),
        blacklist,
        config.scheduler.max_guild_storage_bytes,
    ))
}

// `add` and `list` never consult the blacklist.
fn local_blacklist(config: &SoundCronConfig) -> Arc<dyn Blacklist> {
    Arc::new(MemoryBlacklist::new(blacklist_ttl(config)))
}

pub(crate) fn blacklist_ttl(config: &SoundCronConfig) -> Duration {
    Duration::from_secs(config.blacklist.ttl_secs)
}
