use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use soundcron_core::{
    dispatch::Dispatcher,
    membership::{most_populated_voice_channel, MembershipLookup},
    DispatchedJob, Occurrence,
};

use crate::{error::Result, store::ScheduleStore};

/// What one poll cycle did. Returned by [`Poller::tick_at`] for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub claimed: usize,
    pub dispatched: usize,
    /// Occurrences dropped because their guild had no occupied voice channel
    /// or the lookup failed.
    pub skipped: usize,
    pub dispatch_failed: bool,
    pub refreshed: usize,
    pub refresh_failures: usize,
}

/// Control loop: claim due occurrences, resolve a channel, dispatch, refill.
pub struct Poller {
    store: Arc<ScheduleStore>,
    membership: Arc<dyn MembershipLookup>,
    dispatcher: Arc<dyn Dispatcher>,
    interval: Duration,
    lookahead: chrono::Duration,
}

impl Poller {
    pub fn new(
        store: Arc<ScheduleStore>,
        membership: Arc<dyn MembershipLookup>,
        dispatcher: Arc<dyn Dispatcher>,
        interval: Duration,
        lookahead: Duration,
    ) -> Self {
        Self {
            store,
            membership,
            dispatcher,
            interval,
            lookahead: chrono::Duration::from_std(lookahead)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        }
    }

    /// Poll every `interval` until `shutdown` broadcasts `true`.
    ///
    /// A tick runs to completion before the next one starts; ticks that would
    /// have fired meanwhile are skipped, not queued.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            lookahead_secs = self.lookahead.num_seconds(),
            "poller started"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick_at(Utc::now()).await {
                        Ok(summary) if summary.claimed > 0 => {
                            info!(
                                claimed = summary.claimed,
                                dispatched = summary.dispatched,
                                skipped = summary.skipped,
                                refreshed = summary.refreshed,
                                "poll cycle complete"
                            );
                        }
                        Ok(_) => debug!("nothing due"),
                        Err(e) => error!("poll cycle failed: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("poller shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one poll cycle as if the wall clock read `now`.
    ///
    /// Only a failed claim is returned as an error; lookup, dispatch and
    /// refresh failures are logged and reflected in the summary.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let claimed = self.store.claim_due_at(now, now + self.lookahead)?;
        let mut summary = TickSummary {
            claimed: claimed.len(),
            ..TickSummary::default()
        };
        if claimed.is_empty() {
            return Ok(summary);
        }

        let jobs = self.resolve_channels(&claimed).await;
        summary.skipped = claimed.len() - jobs.len();

        if !jobs.is_empty() {
            match self.dispatcher.dispatch(&jobs).await {
                Ok(()) => summary.dispatched = jobs.len(),
                Err(e) => {
                    summary.dispatch_failed = true;
                    // Claimed rows are not re-claimable; these occurrences are lost.
                    for job in &jobs {
                        error!(
                            soundcron_id = %job.soundcron_id,
                            job_name = %job.name,
                            guild_id = %job.guild_id,
                            run_at = %job.run_at,
                            target_channel_id = %job.target_channel_id,
                            "dispatch failed after claim: {e}"
                        );
                    }
                }
            }
        }

        let touched: BTreeSet<&str> = claimed.iter().map(|o| o.soundcron_id.as_str()).collect();
        for soundcron_id in touched {
            match self.store.refresh_schedule_at(soundcron_id, now) {
                Ok(_) => summary.refreshed += 1,
                Err(e) => {
                    summary.refresh_failures += 1;
                    warn!(soundcron_id, "schedule refresh failed: {e}");
                }
            }
        }

        Ok(summary)
    }

    /// Map each occurrence to a job aimed at its guild's busiest voice channel.
    /// Each guild is looked up once per tick.
    async fn resolve_channels(&self, occurrences: &[Occurrence]) -> Vec<DispatchedJob> {
        let mut targets: HashMap<&str, Option<String>> = HashMap::new();
        let mut jobs = Vec::with_capacity(occurrences.len());

        for occ in occurrences {
            let guild_id = occ.guild_id.as_str();
            if !targets.contains_key(guild_id) {
                let target = match self.membership.guild_channels(guild_id).await {
                    Ok(channels) => {
                        most_populated_voice_channel(&channels).map(|c| c.id.clone())
                    }
                    Err(e) => {
                        warn!(guild_id, "channel lookup failed: {e}");
                        None
                    }
                };
                targets.insert(guild_id, target);
            }

            match targets.get(guild_id).and_then(|t| t.as_ref()) {
                Some(channel_id) => {
                    jobs.push(DispatchedJob::from_occurrence(occ.clone(), channel_id.clone()))
                }
                None => debug!(
                    soundcron_id = %occ.soundcron_id,
                    guild_id,
                    run_at = %occ.run_at,
                    "no occupied voice channel, occurrence skipped"
                ),
            }
        }
        jobs
    }
}
