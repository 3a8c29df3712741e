//! `soundcron-scheduler`: the scheduling core, persisted in SQLite.
//!
//! # Overview
//!
//! Every SoundCron keeps a sliding window of upcoming occurrences in the
//! `occurrences` table. The [`poller::Poller`] wakes on a fixed interval,
//! claims the occurrences falling inside its lookahead horizon, resolves a
//! voice channel for each, hands the batch to a
//! [`Dispatcher`](soundcron_core::dispatch::Dispatcher) and tops the window
//! back up.
//!
//! | Piece                        | Role                                             |
//! |------------------------------|--------------------------------------------------|
//! | [`schedule::next_run_times`] | Five-field cron and `@macro` occurrence calculus  |
//! | [`store::ScheduleStore`]     | Definitions, occurrence rows, race-free claiming |
//! | [`poller::Poller`]           | Claim, resolve, dispatch, refresh loop           |
//! | [`service::SoundCronService`]| Validated add, list, delete-with-blacklist       |

pub mod db;
pub mod error;
pub mod poller;
pub mod schedule;
pub mod service;
pub mod store;
pub mod types;

pub use error::{Result, SchedulerError};
pub use poller::{Poller, TickSummary};
pub use schedule::{next_run_times, validate_cron};
pub use service::SoundCronService;
pub use store::ScheduleStore;
pub use types::OccurrenceRecord;
