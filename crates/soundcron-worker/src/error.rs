use std::time::Duration;

use thiserror::Error;

use crate::{blob::FetchError, codec::FrameError};

/// Why a delivery ended in `Failed`. None of these are retried.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("could not join voice channel: {0}")]
    Join(String),

    #[error("voice transport did not accept a frame within {after:?}")]
    VoiceSendTimeout { after: Duration },

    #[error("voice transport closed mid-playback")]
    TransportClosed,

    #[error("voice transport error: {0}")]
    Transport(String),

    #[error("audio decode failed: {0}")]
    Decode(#[from] FrameError),

    #[error("audio fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("blacklist check failed: {0}")]
    BlacklistCheck(String),
}
