//! Songbird-backed voice transport.
//!
//! Songbird plays inputs it can probe, so the worker's raw Opus frames are
//! wrapped in a DCA1 stream: the `DCA1` magic, a little-endian `i32` metadata
//! length, the JSON metadata, then the same `u16` length-prefixed frames the
//! blob store serves. Opus passes through without re-encoding.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serenity::all::{ChannelId, GuildId};
use songbird::events::{Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent};
use songbird::input::{AudioStream, Input, LiveInput};
use songbird::tracks::TrackHandle;
use songbird::{Call, Songbird};
use symphonia_core::io::MediaSource;
use symphonia_core::probe::Hint;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Encoder;
use tracing::{debug, info, warn};

use soundcron_worker::{DeliveryError, OpusFrameCodec, VoiceConnector, VoiceSession};

use crate::error::parse_snowflake;

const DCA_MAGIC: &[u8; 4] = b"DCA1";

/// Joins voice channels through the process-wide songbird manager.
pub struct SongbirdConnector {
    manager: Arc<Songbird>,
    frame_buffer: usize,
    drain_timeout: Duration,
}

impl SongbirdConnector {
    pub fn new(manager: Arc<Songbird>, frame_buffer: usize, drain_timeout: Duration) -> Self {
        Self {
            manager,
            frame_buffer: frame_buffer.max(1),
            drain_timeout,
        }
    }
}

#[async_trait]
impl VoiceConnector for SongbirdConnector {
    async fn join(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Box<dyn VoiceSession>, DeliveryError> {
        let guild = GuildId::new(parse_snowflake(guild_id).map_err(join_error)?);
        let channel = ChannelId::new(parse_snowflake(channel_id).map_err(join_error)?);

        let call = match self.manager.join(guild, channel).await {
            Ok(call) => call,
            Err(e) => {
                // A half-open handshake would block the next join in this guild.
                let _ = self.manager.remove(guild).await;
                return Err(join_error(e));
            }
        };
        info!(guild_id, channel_id, "joined voice channel");

        let (frames, source) = mpsc::channel(self.frame_buffer);
        Ok(Box::new(SongbirdSession {
            manager: Arc::clone(&self.manager),
            guild,
            call,
            frames: Some(frames),
            source: Some(source),
            track: None,
            ended: None,
            drain_timeout: self.drain_timeout,
        }))
    }
}

fn join_error(e: impl std::fmt::Display) -> DeliveryError {
    DeliveryError::Join(e.to_string())
}

fn transport_error(e: impl std::fmt::Display) -> DeliveryError {
    DeliveryError::Transport(e.to_string())
}

struct SongbirdSession {
    manager: Arc<Songbird>,
    guild: GuildId,
    call: Arc<tokio::sync::Mutex<Call>>,
    frames: Option<mpsc::Sender<Bytes>>,
    source: Option<mpsc::Receiver<Bytes>>,
    track: Option<TrackHandle>,
    ended: Option<oneshot::Receiver<()>>,
    drain_timeout: Duration,
}

#[async_trait]
impl VoiceSession for SongbirdSession {
    fn take_frames(&mut self) -> Option<mpsc::Sender<Bytes>> {
        self.frames.take()
    }

    async fn speaking(&mut self, on: bool) -> Result<(), DeliveryError> {
        if on {
            let Some(source) = self.source.take() else {
                return Ok(());
            };
            let mut hint = Hint::new();
            hint.with_extension("dca");
            let input = Input::Live(
                LiveInput::Raw(AudioStream {
                    input: Box::new(ChannelSource::new(source)) as Box<dyn MediaSource>,
                    hint: Some(hint),
                }),
                None,
            );

            let handle = self.call.lock().await.play_input(input);
            let (ended_tx, ended_rx) = oneshot::channel();
            let notifier = TrackEnded(Arc::new(Mutex::new(Some(ended_tx))));
            handle
                .add_event(Event::Track(TrackEvent::End), notifier.clone())
                .map_err(transport_error)?;
            handle
                .add_event(Event::Track(TrackEvent::Error), notifier)
                .map_err(transport_error)?;
            self.track = Some(handle);
            self.ended = Some(ended_rx);
            return Ok(());
        }

        // Closing the channel ends the DCA stream once queued frames are read.
        self.frames.take();
        if let Some(ended) = self.ended.take() {
            if tokio::time::timeout(self.drain_timeout, ended).await.is_err() {
                warn!(guild_id = %self.guild, "playback did not drain in time, stopping track");
            }
        }
        if let Some(track) = self.track.take() {
            let _ = track.stop();
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DeliveryError> {
        self.manager
            .remove(self.guild)
            .await
            .map_err(transport_error)?;
        debug!(guild_id = %self.guild, "left voice channel");
        Ok(())
    }
}

#[derive(Clone)]
struct TrackEnded(Arc<Mutex<Option<oneshot::Sender<()>>>>);

#[async_trait]
impl VoiceEventHandler for TrackEnded {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        let sender = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
        None
    }
}

/// DCA1 header announcing 48 kHz stereo Opus in 20 ms frames.
pub fn dca_header() -> Vec<u8> {
    let metadata = serde_json::json!({
        "dca": {
            "version": 1,
            "tool": {
                "name": "soundcron",
                "version": env!("CARGO_PKG_VERSION"),
                "url": null,
                "author": null
            }
        },
        "opus": {
            "mode": "voip",
            "sample_rate": 48000,
            "frame_size": 960,
            "abr": null,
            "vbr": true,
            "channels": 2
        },
        "info": null,
        "origin": null,
        "extra": null
    })
    .to_string()
    .into_bytes();

    let mut header = Vec::with_capacity(DCA_MAGIC.len() + 4 + metadata.len());
    header.extend_from_slice(DCA_MAGIC);
    header.put_i32_le(metadata.len() as i32);
    header.extend_from_slice(&metadata);
    header
}

/// Blocking reader over the outbound frame channel, for songbird's decoder
/// threads. Yields the DCA header, then each frame as it arrives, then EOF
/// once every sender is dropped.
pub struct ChannelSource {
    frames: Mutex<mpsc::Receiver<Bytes>>,
    pending: BytesMut,
    finished: bool,
}

impl ChannelSource {
    pub fn new(frames: mpsc::Receiver<Bytes>) -> Self {
        Self {
            frames: Mutex::new(frames),
            pending: BytesMut::from(&dca_header()[..]),
            finished: false,
        }
    }
}

impl Read for ChannelSource {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            if self.finished {
                return Ok(0);
            }
            let next = self
                .frames
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .blocking_recv();
            match next {
                Some(frame) => OpusFrameCodec
                    .encode(&frame[..], &mut self.pending)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
                None => self.finished = true,
            }
        }
        let n = out.len().min(self.pending.len());
        out[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }
}

impl Seek for ChannelSource {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "live voice stream is not seekable",
        ))
    }
}

impl MediaSource for ChannelSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_carries_metadata_length() {
        let header = dca_header();
        assert_eq!(&header[..4], b"DCA1");
        let len = i32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        assert_eq!(header.len(), 8 + len);

        let metadata: serde_json::Value = serde_json::from_slice(&header[8..]).unwrap();
        assert_eq!(metadata["opus"]["sample_rate"], 48000);
        assert_eq!(metadata["opus"]["channels"], 2);
        assert_eq!(metadata["dca"]["tool"]["name"], "soundcron");
    }

    #[test]
    fn source_streams_header_then_frames_until_closed() {
        let (tx, rx) = mpsc::channel(4);
        tx.try_send(Bytes::from_static(b"abc")).unwrap();
        tx.try_send(Bytes::from_static(b"de")).unwrap();
        drop(tx);

        let mut out = Vec::new();
        ChannelSource::new(rx).read_to_end(&mut out).unwrap();

        let header = dca_header();
        assert_eq!(&out[..header.len()], &header[..]);
        assert_eq!(&out[header.len()..], &[3, 0, b'a', b'b', b'c', 2, 0, b'd', b'e']);
    }

    #[test]
    fn small_reads_are_stitched_together() {
        let (tx, rx) = mpsc::channel(1);
        tx.try_send(Bytes::from_static(b"xyz")).unwrap();
        drop(tx);

        let mut source = ChannelSource::new(rx);
        let mut out = Vec::new();
        let mut chunk = [0u8; 3];
        loop {
            let n = source.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out.len(), dca_header().len() + 5);
        assert!(source.seek(SeekFrom::Start(0)).is_err());
    }
}
