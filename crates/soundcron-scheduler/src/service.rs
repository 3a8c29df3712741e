use std::sync::Arc;

use tracing::info;

use soundcron_core::{blacklist::Blacklist, SoundCron};

use crate::{
    error::{Result, SchedulerError},
    schedule::validate_cron,
    store::ScheduleStore,
};

/// Entry point for the command layer: validated add, list, and delete.
pub struct SoundCronService {
    store: Arc<ScheduleStore>,
    blacklist: Arc<dyn Blacklist>,
    max_guild_storage_bytes: i64,
}

impl SoundCronService {
    pub fn new(
        store: Arc<ScheduleStore>,
        blacklist: Arc<dyn Blacklist>,
        max_guild_storage_bytes: i64,
    ) -> Self {
        Self {
            store,
            blacklist,
            max_guild_storage_bytes,
        }
    }

    pub fn store(&self) -> &Arc<ScheduleStore> {
        &self.store
    }

    /// Validate and persist a new SoundCron.
    ///
    /// Checks run in order: guild storage quota, duplicate name, cron syntax.
    /// Nothing is written unless all three pass.
    pub async fn add_soundcron(
        &self,
        guild_id: &str,
        name: &str,
        cron: &str,
        file_size: i64,
    ) -> Result<SoundCron> {
        let existing = self.store.list_soundcrons(guild_id)?;

        let current: i64 = existing.iter().map(|s| s.file_size).sum();
        if current.saturating_add(file_size) > self.max_guild_storage_bytes {
            return Err(SchedulerError::QuotaExceeded {
                requested: file_size,
                current,
                max: self.max_guild_storage_bytes,
            });
        }

        if existing.iter().any(|s| s.name == name) {
            return Err(SchedulerError::DuplicateName {
                guild_id: guild_id.to_string(),
                name: name.to_string(),
            });
        }

        validate_cron(cron)?;

        let soundcron = SoundCron::new(name, guild_id, cron, file_size);
        self.store.save_soundcron(&soundcron)?;
        Ok(soundcron)
    }

    /// The guild's SoundCrons, most recently accessed first.
    pub async fn list_soundcrons(&self, guild_id: &str) -> Result<Vec<SoundCron>> {
        let mut soundcrons = self.store.list_soundcrons(guild_id)?;
        soundcrons.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        Ok(soundcrons)
    }

    pub async fn touch(&self, soundcron_id: &str) -> Result<()> {
        self.store.touch(soundcron_id)
    }

    /// Delete a SoundCron and stop any of its occurrences already in flight.
    ///
    /// The ID is blacklisted before the row is removed, so a failed blacklist
    /// write leaves the SoundCron in place rather than deleted-but-playing.
    pub async fn delete_soundcron(&self, soundcron_id: &str) -> Result<()> {
        let soundcron = self.store.get_soundcron(soundcron_id)?;
        self.blacklist.add(soundcron_id).await?;
        self.store.delete_soundcron(soundcron_id)?;
        info!(
            soundcron_id,
            name = %soundcron.name,
            guild_id = %soundcron.guild_id,
            "soundcron deleted and blacklisted"
        );
        Ok(())
    }
}
