//! `soundcron-core`: types and contracts shared by every SoundCron component.
//!
//! The scheduler, the queue and the worker never talk to each other directly;
//! they exchange [`types::DispatchedJob`] values and depend on the collaborator
//! traits defined here ([`dispatch::Dispatcher`], [`blacklist::Blacklist`],
//! [`membership::MembershipLookup`]).

pub mod blacklist;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod membership;
pub mod types;
pub mod wire;

pub use error::{CoreError, Result};
pub use types::{DispatchedJob, Occurrence, SoundCron};
