use async_trait::async_trait;

use crate::error::Result;

/// Time-boxed denylist of SoundCron IDs whose queued occurrences must not play.
///
/// A live entry is authoritative: workers treat `true` as a hard skip,
/// regardless of whether the SoundCron or its occurrence rows still exist.
#[async_trait]
pub trait Blacklist: Send + Sync {
    async fn add(&self, soundcron_id: &str) -> Result<()>;

    async fn is_blacklisted(&self, soundcron_id: &str) -> Result<bool>;
}

/// Storage key for a blacklisted SoundCron.
pub fn blacklist_key(soundcron_id: &str) -> String {
    format!("soundcron:job:{soundcron_id}:blacklist")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_embeds_id() {
        assert_eq!(blacklist_key("abc"), "soundcron:job:abc:blacklist");
    }
}
