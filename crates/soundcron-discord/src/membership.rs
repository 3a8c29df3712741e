use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serenity::all::{ChannelId, ChannelType, GuildId};
use serenity::cache::Cache;

use soundcron_core::{
    membership::{ChannelKind, GuildChannel, MembershipLookup},
    CoreError,
};

use crate::error::{parse_snowflake, DiscordError};

/// The current client's cache; replaced on every reconnect.
pub type SharedCache = Arc<RwLock<Option<Arc<Cache>>>>;

/// Guild channel occupancy read from the gateway cache (no REST calls).
#[derive(Clone)]
pub struct CacheMembership {
    cache: SharedCache,
}

impl CacheMembership {
    pub fn new(cache: SharedCache) -> Self {
        Self { cache }
    }

    fn snapshot(&self, guild_id: &str) -> Result<Vec<GuildChannel>, DiscordError> {
        let guild_id = GuildId::new(parse_snowflake(guild_id)?);
        let cache = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(DiscordError::NotConnected)?;

        // A guild missing from the cache is treated as having nobody in voice.
        let Some(guild) = cache.guild(guild_id) else {
            return Ok(Vec::new());
        };
        let channels = summarize(
            guild
                .channels
                .values()
                .map(|c| (c.id, c.kind, c.position)),
            guild.voice_states.values().filter_map(|vs| vs.channel_id),
        );
        Ok(channels)
    }
}

#[async_trait]
impl MembershipLookup for CacheMembership {
    async fn guild_channels(&self, guild_id: &str) -> soundcron_core::Result<Vec<GuildChannel>> {
        self.snapshot(guild_id).map_err(|e| CoreError::Membership {
            guild_id: guild_id.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Count connected members per channel and order channels by their position
/// in the guild (then ID), which is the order ties are broken in.
fn summarize(
    channels: impl Iterator<Item = (ChannelId, ChannelType, u16)>,
    connected: impl Iterator<Item = ChannelId>,
) -> Vec<GuildChannel> {
    let mut members: HashMap<ChannelId, usize> = HashMap::new();
    for channel_id in connected {
        *members.entry(channel_id).or_default() += 1;
    }

    let mut channels: Vec<_> = channels.collect();
    channels.sort_by_key(|(id, _, position)| (*position, *id));
    channels
        .into_iter()
        .map(|(id, kind, _)| GuildChannel {
            id: id.to_string(),
            kind: match kind {
                ChannelType::Voice => ChannelKind::Voice,
                _ => ChannelKind::Other,
            },
            members: members.get(&id).copied().unwrap_or(0),
        })
        .collect()
}
