use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::DeliveryError;

/// Joins voice channels on behalf of a delivery.
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    async fn join(&self, guild_id: &str, channel_id: &str)
        -> Result<Box<dyn VoiceSession>, DeliveryError>;
}

/// One joined voice channel, held for the length of one playback.
#[async_trait]
pub trait VoiceSession: Send {
    /// The bounded outbound frame channel. Handed out once; dropping the
    /// sender marks the end of the audio.
    fn take_frames(&mut self) -> Option<mpsc::Sender<Bytes>>;

    /// Toggle the speaking indicator. `false` also waits for queued frames
    /// to finish playing.
    async fn speaking(&mut self, on: bool) -> Result<(), DeliveryError>;

    async fn disconnect(&mut self) -> Result<(), DeliveryError>;
}
