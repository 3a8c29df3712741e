use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named, guild-scoped recurring audio job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoundCron {
    /// UUID v4 string, primary key.
    pub id: String,
    /// Display name, unique per guild.
    pub name: String,
    /// Discord guild that owns this SoundCron.
    pub guild_id: String,
    /// Five-field cron expression or macro alias (e.g. `@hourly`).
    pub cron: String,
    /// Size of the stored audio payload in bytes (quota accounting).
    pub file_size: i64,
    /// Last time a user listed or otherwise touched this SoundCron.
    pub last_accessed: DateTime<Utc>,
}

impl SoundCron {
    /// Build a new definition with a fresh ID, accessed "now".
    pub fn new(
        name: impl Into<String>,
        guild_id: impl Into<String>,
        cron: impl Into<String>,
        file_size: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            guild_id: guild_id.into(),
            cron: cron.into(),
            file_size,
            last_accessed: Utc::now(),
        }
    }
}

/// One claimed firing of a SoundCron, as returned by the claim operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub soundcron_id: String,
    pub name: String,
    pub guild_id: String,
    pub run_at: DateTime<Utc>,
}

/// The unit of work handed to the work queue.
///
/// Carries everything a worker needs to play the clip; the only lookups a
/// worker still performs are the blacklist check and the audio fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchedJob {
    pub soundcron_id: String,
    /// User-facing SoundCron name.
    pub name: String,
    pub guild_id: String,
    /// Exact instant the clip should start playing.
    pub run_at: DateTime<Utc>,
    /// Voice channel resolved by the poller at claim time.
    pub target_channel_id: String,
}

impl DispatchedJob {
    pub fn from_occurrence(occurrence: Occurrence, target_channel_id: impl Into<String>) -> Self {
        Self {
            soundcron_id: occurrence.soundcron_id,
            name: occurrence.name,
            guild_id: occurrence.guild_id,
            run_at: occurrence.run_at,
            target_channel_id: target_channel_id.into(),
        }
    }
}
