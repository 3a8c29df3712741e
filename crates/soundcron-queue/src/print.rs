use async_trait::async_trait;
use tracing::info;

use soundcron_core::{dispatch::Dispatcher, wire::format_run_at, DispatchedJob};

/// Dry-run sink: logs every job instead of enqueueing it.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrintDispatcher;

#[async_trait]
impl Dispatcher for PrintDispatcher {
    async fn dispatch(&self, jobs: &[DispatchedJob]) -> soundcron_core::Result<()> {
        for job in jobs {
            info!(
                soundcron_id = %job.soundcron_id,
                job_name = %job.name,
                guild_id = %job.guild_id,
                run_at = %format_run_at(job.run_at),
                target_channel_id = %job.target_channel_id,
                "dry-run dispatch"
            );
        }
        Ok(())
    }
}
