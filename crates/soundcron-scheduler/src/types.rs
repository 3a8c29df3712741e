use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw row of the `occurrences` table, pending or already claimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccurrenceRecord {
    pub soundcron_id: String,
    pub run_at: DateTime<Utc>,
    /// `None` until a poller claims the row.
    pub claimed_at: Option<DateTime<Utc>>,
}

impl OccurrenceRecord {
    pub fn is_claimed(&self) -> bool {
        self.claimed_at.is_some()
    }
}
