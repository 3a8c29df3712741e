use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::info;

use crate::{
    blob::{BlobSource, FetchError},
    error::DeliveryError,
    voice::{VoiceConnector, VoiceSession},
};

/// Stands in for the blob store: logs the fetch and returns no audio.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunBlobs;

#[async_trait]
impl BlobSource for DryRunBlobs {
    async fn fetch(&self, soundcron_id: &str) -> Result<Bytes, FetchError> {
        info!(soundcron_id, "dry-run preload, no audio fetched");
        Ok(Bytes::new())
    }
}

/// Stands in for Discord voice: logs join and leave, swallows frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunVoice;

struct DryRunSession {
    guild_id: String,
    channel_id: String,
    frames: Option<mpsc::Sender<Bytes>>,
}

#[async_trait]
impl VoiceConnector for DryRunVoice {
    async fn join(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Box<dyn VoiceSession>, DeliveryError> {
        info!(guild_id, channel_id, "dry-run join");
        let (tx, mut rx) = mpsc::channel::<Bytes>(1);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        Ok(Box::new(DryRunSession {
            guild_id: guild_id.to_string(),
            channel_id: channel_id.to_string(),
            frames: Some(tx),
        }))
    }
}

#[async_trait]
impl VoiceSession for DryRunSession {
    fn take_frames(&mut self) -> Option<mpsc::Sender<Bytes>> {
        self.frames.take()
    }

    async fn speaking(&mut self, _on: bool) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DeliveryError> {
        info!(guild_id = %self.guild_id, channel_id = %self.channel_id, "dry-run leave");
        Ok(())
    }
}
