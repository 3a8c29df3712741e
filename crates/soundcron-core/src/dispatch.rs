use async_trait::async_trait;

use crate::{error::Result, types::DispatchedJob};

/// Sends claimed occurrences somewhere to be executed.
///
/// Production uses a Redis stream; dry-run mode logs the batch instead. The
/// variant is picked once at startup.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Submit one poll cycle's worth of jobs.
    ///
    /// Best-effort batch: a failure for one job does not roll back the others,
    /// and callers must not assume all-or-nothing delivery.
    async fn dispatch(&self, jobs: &[DispatchedJob]) -> Result<()>;
}
