//! `soundcron-worker`: turns queued jobs into voice playback.
//!
//! For every received job the worker schedules a preload a few seconds before
//! the fire time (blacklist check, then payload fetch) and an execute step at
//! the fire time (join, stream frames, leave). See [`delivery`] for the state
//! machine. Discord itself sits behind [`voice::VoiceConnector`].

pub mod blob;
pub mod codec;
pub mod delivery;
pub mod dry_run;
pub mod error;
pub mod voice;
pub mod worker;

pub use blob::{BlobSource, FetchError, HttpBlobSource};
pub use codec::{FrameError, OpusFrameCodec};
pub use delivery::{
    schedule_delivery, DeliveryConfig, DeliveryDeps, DeliveryHandle, DeliveryOutcome,
    DeliveryState, SkipReason,
};
pub use dry_run::{DryRunBlobs, DryRunVoice};
pub use error::DeliveryError;
pub use voice::{VoiceConnector, VoiceSession};
pub use worker::Worker;
