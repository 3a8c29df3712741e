use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Voice,
    Other,
}

/// A guild channel together with how many users currently sit in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildChannel {
    pub id: String,
    pub kind: ChannelKind,
    pub members: usize,
}

/// Resolves the channels of a guild and their current occupancy.
#[async_trait]
pub trait MembershipLookup: Send + Sync {
    /// Channels in a stable order; ties in [`most_populated_voice_channel`]
    /// go to whichever channel comes first.
    async fn guild_channels(&self, guild_id: &str) -> Result<Vec<GuildChannel>>;
}

/// The voice channel with the most members, or `None` when every voice
/// channel is empty (nobody would hear the clip).
pub fn most_populated_voice_channel(channels: &[GuildChannel]) -> Option<&GuildChannel> {
    let mut best: Option<&GuildChannel> = None;
    for channel in channels {
        if channel.kind != ChannelKind::Voice || channel.members == 0 {
            continue;
        }
        if best.map_or(true, |b| channel.members > b.members) {
            best = Some(channel);
        }
    }
    best
}
