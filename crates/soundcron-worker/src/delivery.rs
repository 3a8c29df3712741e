//! Per-occurrence delivery: preload shortly before the fire time, then play.
//!
//! ```text
//! Scheduled -> Preloading -> Ready ---------> Executing -> Finished
//!                         \-> PreloadFailed              \-> Failed
//! ```
//!
//! The preload and execute steps are two independently spawned timers joined
//! by a oneshot channel. Execute only waits for the preload's result; if the
//! preload task disappears, execute ends the occurrence without playing.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::{mpsc::error::SendTimeoutError, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

use soundcron_core::{blacklist::Blacklist, config::WorkerConfig, DispatchedJob};

use crate::{
    blob::BlobSource,
    codec::OpusFrameCodec,
    error::DeliveryError,
    voice::{VoiceConnector, VoiceSession},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Scheduled,
    Preloading,
    Ready,
    PreloadFailed,
    Executing,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Blacklisted,
    /// The preload step never reported back.
    PreloadLost,
}

#[derive(Debug)]
pub enum DeliveryOutcome {
    Finished,
    Skipped(SkipReason),
    Failed(DeliveryError),
}

impl DeliveryOutcome {
    pub fn is_finished(&self) -> bool {
        matches!(self, DeliveryOutcome::Finished)
    }
}

/// What the preload step hands to the execute step.
enum Preloaded {
    Payload(Bytes),
    Blacklisted,
    Failed(DeliveryError),
}

/// Collaborators shared by every delivery of one worker process.
#[derive(Clone)]
pub struct DeliveryDeps {
    pub blacklist: Arc<dyn Blacklist>,
    pub blobs: Arc<dyn BlobSource>,
    pub voice: Arc<dyn VoiceConnector>,
}

#[derive(Debug, Clone, Copy)]
pub struct DeliveryConfig {
    /// How long before the fire time the payload is fetched.
    pub preload_margin: Duration,
    /// Max wait for the transport to accept a single frame.
    pub send_timeout: Duration,
}

impl From<&WorkerConfig> for DeliveryConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            preload_margin: Duration::from_secs(config.preload_margin_secs),
            send_timeout: Duration::from_secs(config.send_timeout_secs),
        }
    }
}

/// A scheduled delivery. `state` follows the machine above; `outcome`
/// resolves once the occurrence is over.
pub struct DeliveryHandle {
    pub state: watch::Receiver<DeliveryState>,
    pub outcome: JoinHandle<DeliveryOutcome>,
}

/// Schedule the preload and execute steps for `job`.
///
/// A fire time already in the past runs both steps immediately.
pub fn schedule_delivery(
    job: DispatchedJob,
    deps: DeliveryDeps,
    config: DeliveryConfig,
) -> DeliveryHandle {
    let (state_tx, state_rx) = watch::channel(DeliveryState::Scheduled);
    let state_tx = Arc::new(state_tx);
    let (preload_tx, preload_rx) = oneshot::channel::<Preloaded>();

    let until_fire = (job.run_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    let now = Instant::now();
    let execute_at = now + until_fire;
    let preload_at = now + until_fire.saturating_sub(config.preload_margin);

    info!(
        soundcron_id = %job.soundcron_id,
        job_name = %job.name,
        run_at = %job.run_at,
        fire_in_ms = until_fire.as_millis() as u64,
        "delivery scheduled"
    );

    {
        let job = job.clone();
        let deps = deps.clone();
        let state_tx = Arc::clone(&state_tx);
        tokio::spawn(async move {
            sleep_until(preload_at).await;
            state_tx.send_replace(DeliveryState::Preloading);
            let preloaded = preload(&job, &deps).await;
            state_tx.send_replace(match preloaded {
                Preloaded::Payload(_) => DeliveryState::Ready,
                _ => DeliveryState::PreloadFailed,
            });
            // Execute may have given up already; nothing to do then.
            let _ = preload_tx.send(preloaded);
        });
    }

    let outcome = tokio::spawn(async move {
        sleep_until(execute_at).await;
        let outcome = match preload_rx.await {
            Ok(Preloaded::Payload(payload)) => {
                state_tx.send_replace(DeliveryState::Executing);
                match play(&job, payload, deps.voice.as_ref(), config.send_timeout).await {
                    Ok(frames) => {
                        info!(
                            soundcron_id = %job.soundcron_id,
                            job_name = %job.name,
                            guild_id = %job.guild_id,
                            target_channel_id = %job.target_channel_id,
                            frames,
                            "delivery finished"
                        );
                        DeliveryOutcome::Finished
                    }
                    Err(e) => DeliveryOutcome::Failed(e),
                }
            }
            Ok(Preloaded::Blacklisted) => DeliveryOutcome::Skipped(SkipReason::Blacklisted),
            Ok(Preloaded::Failed(e)) => DeliveryOutcome::Failed(e),
            Err(_) => DeliveryOutcome::Skipped(SkipReason::PreloadLost),
        };

        match &outcome {
            DeliveryOutcome::Finished => {
                state_tx.send_replace(DeliveryState::Finished);
            }
            DeliveryOutcome::Skipped(reason) => info!(
                soundcron_id = %job.soundcron_id,
                job_name = %job.name,
                run_at = %job.run_at,
                ?reason,
                "delivery skipped"
            ),
            DeliveryOutcome::Failed(e) => {
                error!(
                    soundcron_id = %job.soundcron_id,
                    job_name = %job.name,
                    guild_id = %job.guild_id,
                    run_at = %job.run_at,
                    target_channel_id = %job.target_channel_id,
                    "delivery failed: {e}"
                );
                state_tx.send_replace(DeliveryState::Failed);
            }
        }
        outcome
    });

    DeliveryHandle {
        state: state_rx,
        outcome,
    }
}

/// Blacklist check, then fetch. A blacklisted ID never reaches the blob store.
async fn preload(job: &DispatchedJob, deps: &DeliveryDeps) -> Preloaded {
    match deps.blacklist.is_blacklisted(&job.soundcron_id).await {
        Ok(true) => {
            debug!(soundcron_id = %job.soundcron_id, "blacklisted, not preloading");
            return Preloaded::Blacklisted;
        }
        Ok(false) => {}
        Err(e) => return Preloaded::Failed(DeliveryError::BlacklistCheck(e.to_string())),
    }

    match deps.blobs.fetch(&job.soundcron_id).await {
        Ok(payload) => {
            debug!(soundcron_id = %job.soundcron_id, bytes = payload.len(), "preloaded");
            Preloaded::Payload(payload)
        }
        Err(e) => Preloaded::Failed(e.into()),
    }
}

/// Join, stream, and always leave. Returns the number of frames sent.
async fn play(
    job: &DispatchedJob,
    payload: Bytes,
    voice: &dyn VoiceConnector,
    send_timeout: Duration,
) -> Result<usize, DeliveryError> {
    let mut session = voice.join(&job.guild_id, &job.target_channel_id).await?;
    let streamed = stream_frames(session.as_mut(), payload, send_timeout).await;

    if let Err(e) = session.speaking(false).await {
        warn!(soundcron_id = %job.soundcron_id, "failed to stop speaking: {e}");
    }
    if let Err(e) = session.disconnect().await {
        warn!(soundcron_id = %job.soundcron_id, "failed to leave voice channel: {e}");
    }
    streamed
}

async fn stream_frames(
    session: &mut dyn VoiceSession,
    payload: Bytes,
    send_timeout: Duration,
) -> Result<usize, DeliveryError> {
    let frames_tx = session.take_frames().ok_or(DeliveryError::TransportClosed)?;
    session.speaking(true).await?;

    let mut frames = FramedRead::new(&payload[..], OpusFrameCodec);
    let mut sent = 0;
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        if frame.is_empty() {
            continue;
        }
        frames_tx
            .send_timeout(frame.freeze(), send_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => DeliveryError::VoiceSendTimeout {
                    after: send_timeout,
                },
                SendTimeoutError::Closed(_) => DeliveryError::TransportClosed,
            })?;
        sent += 1;
    }
    Ok(sent)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::BytesMut;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio_util::codec::Encoder;

    use crate::blob::FetchError;
    use soundcron_core::CoreError;

    pub(crate) fn job() -> DispatchedJob {
        DispatchedJob {
            soundcron_id: "sc-1".into(),
            name: "horn".into(),
            guild_id: "G1".into(),
            run_at: Utc::now(),
            target_channel_id: "C1".into(),
        }
    }

    pub(crate) fn payload(frames: &[&[u8]]) -> Bytes {
        let mut buf = BytesMut::new();
        for frame in frames {
            OpusFrameCodec.encode(*frame, &mut buf).unwrap();
        }
        buf.freeze()
    }

    #[derive(Default)]
    pub(crate) struct FakeBlacklist {
        pub ids: Mutex<HashSet<String>>,
        pub broken: bool,
    }

    #[async_trait]
    impl Blacklist for FakeBlacklist {
        async fn add(&self, soundcron_id: &str) -> soundcron_core::Result<()> {
            self.ids.lock().unwrap().insert(soundcron_id.to_string());
            Ok(())
        }

        async fn is_blacklisted(&self, soundcron_id: &str) -> soundcron_core::Result<bool> {
            if self.broken {
                return Err(CoreError::Blacklist("unreachable".into()));
            }
            Ok(self.ids.lock().unwrap().contains(soundcron_id))
        }
    }

    pub(crate) struct FakeBlobs {
        pub payload: Option<Bytes>,
        pub fetches: Mutex<Vec<String>>,
    }

    impl FakeBlobs {
        pub fn serving(payload: Bytes) -> Self {
            Self {
                payload: Some(payload),
                fetches: Mutex::new(Vec::new()),
            }
        }

        fn missing() -> Self {
            Self {
                payload: None,
                fetches: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BlobSource for FakeBlobs {
        async fn fetch(&self, soundcron_id: &str) -> Result<Bytes, FetchError> {
            self.fetches.lock().unwrap().push(soundcron_id.to_string());
            self.payload.clone().ok_or_else(|| FetchError::Status {
                status: 404,
                url: format!("fake://{soundcron_id}"),
            })
        }
    }

    /// Records calls in order. `stalled` sessions never read their frames.
    #[derive(Default)]
    pub(crate) struct FakeVoice {
        pub events: Arc<Mutex<Vec<String>>>,
        pub played: Arc<Mutex<Vec<Bytes>>>,
        pub capacity: usize,
        pub stalled: bool,
        pub refuse_join: bool,
    }

    struct FakeSession {
        frames: Option<mpsc::Sender<Bytes>>,
        drain: Option<JoinHandle<()>>,
        _stalled_rx: Option<mpsc::Receiver<Bytes>>,
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl VoiceConnector for FakeVoice {
        async fn join(
            &self,
            guild_id: &str,
            channel_id: &str,
        ) -> Result<Box<dyn VoiceSession>, DeliveryError> {
            if self.refuse_join {
                return Err(DeliveryError::Join("missing permissions".into()));
            }
            self.events
                .lock()
                .unwrap()
                .push(format!("join {guild_id}/{channel_id}"));

            let (tx, mut rx) = mpsc::channel(self.capacity.max(1));
            let (drain, stalled_rx) = if self.stalled {
                (None, Some(rx))
            } else {
                let played = Arc::clone(&self.played);
                let handle = tokio::spawn(async move {
                    while let Some(frame) = rx.recv().await {
                        played.lock().unwrap().push(frame);
                    }
                });
                (Some(handle), None)
            };
            Ok(Box::new(FakeSession {
                frames: Some(tx),
                drain,
                _stalled_rx: stalled_rx,
                events: Arc::clone(&self.events),
            }))
        }
    }

    #[async_trait]
    impl VoiceSession for FakeSession {
        fn take_frames(&mut self) -> Option<mpsc::Sender<Bytes>> {
            self.frames.take()
        }

        async fn speaking(&mut self, on: bool) -> Result<(), DeliveryError> {
            self.events.lock().unwrap().push(format!("speaking {on}"));
            if !on {
                if let Some(drain) = self.drain.take() {
                    let _ = drain.await;
                }
            }
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), DeliveryError> {
            self.events.lock().unwrap().push("disconnect".into());
            Ok(())
        }
    }

    fn deps(blacklist: FakeBlacklist, blobs: Arc<FakeBlobs>, voice: Arc<FakeVoice>) -> DeliveryDeps {
        DeliveryDeps {
            blacklist: Arc::new(blacklist),
            blobs,
            voice,
        }
    }

    fn config() -> DeliveryConfig {
        DeliveryConfig {
            preload_margin: Duration::from_secs(5),
            send_timeout: Duration::from_millis(50),
        }
    }

    fn voice() -> Arc<FakeVoice> {
        Arc::new(FakeVoice {
            capacity: 8,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn plays_every_frame_then_leaves() {
        let blobs = Arc::new(FakeBlobs::serving(payload(&[b"f1", b"f2", b"f3"])));
        let voice = voice();
        let handle = schedule_delivery(
            job(),
            deps(FakeBlacklist::default(), Arc::clone(&blobs), Arc::clone(&voice)),
            config(),
        );

        let outcome = handle.outcome.await.unwrap();
        assert!(outcome.is_finished(), "{outcome:?}");
        assert_eq!(*handle.state.borrow(), DeliveryState::Finished);
        assert_eq!(*voice.played.lock().unwrap(), vec!["f1", "f2", "f3"]);
        assert_eq!(
            *voice.events.lock().unwrap(),
            vec!["join G1/C1", "speaking true", "speaking false", "disconnect"]
        );
        assert_eq!(*blobs.fetches.lock().unwrap(), vec!["sc-1"]);
    }

    #[tokio::test]
    async fn blacklisted_job_never_fetches_or_joins() {
        let blacklist = FakeBlacklist::default();
        blacklist.ids.lock().unwrap().insert("sc-1".into());
        let blobs = Arc::new(FakeBlobs::serving(payload(&[b"f1"])));
        let voice = voice();

        let handle = schedule_delivery(
            job(),
            deps(blacklist, Arc::clone(&blobs), Arc::clone(&voice)),
            config(),
        );
        let outcome = handle.outcome.await.unwrap();
        assert!(matches!(
            outcome,
            DeliveryOutcome::Skipped(SkipReason::Blacklisted)
        ));
        assert_eq!(*handle.state.borrow(), DeliveryState::PreloadFailed);
        assert!(blobs.fetches.lock().unwrap().is_empty());
        assert!(voice.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn blacklist_outage_fails_without_joining() {
        let blacklist = FakeBlacklist {
            broken: true,
            ..Default::default()
        };
        let voice = voice();
        let handle = schedule_delivery(
            job(),
            deps(
                blacklist,
                Arc::new(FakeBlobs::serving(payload(&[b"f1"]))),
                Arc::clone(&voice),
            ),
            config(),
        );
        assert!(matches!(
            handle.outcome.await.unwrap(),
            DeliveryOutcome::Failed(DeliveryError::BlacklistCheck(_))
        ));
        assert!(voice.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_has_no_side_effects() {
        let voice = voice();
        let handle = schedule_delivery(
            job(),
            deps(
                FakeBlacklist::default(),
                Arc::new(FakeBlobs::missing()),
                Arc::clone(&voice),
            ),
            config(),
        );
        assert!(matches!(
            handle.outcome.await.unwrap(),
            DeliveryOutcome::Failed(DeliveryError::Fetch(FetchError::Status { status: 404, .. }))
        ));
        assert_eq!(*handle.state.borrow(), DeliveryState::Failed);
        assert!(voice.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stalled_transport_times_out_and_still_disconnects() {
        let voice = Arc::new(FakeVoice {
            capacity: 1,
            stalled: true,
            ..Default::default()
        });
        let handle = schedule_delivery(
            job(),
            deps(
                FakeBlacklist::default(),
                Arc::new(FakeBlobs::serving(payload(&[b"f1", b"f2", b"f3"]))),
                Arc::clone(&voice),
            ),
            config(),
        );
        assert!(matches!(
            handle.outcome.await.unwrap(),
            DeliveryOutcome::Failed(DeliveryError::VoiceSendTimeout { .. })
        ));
        let events = voice.events.lock().unwrap();
        assert_eq!(events.last().map(String::as_str), Some("disconnect"));
        assert!(events.contains(&"speaking false".to_string()));
    }

    #[tokio::test]
    async fn join_failure_is_reported() {
        let voice = Arc::new(FakeVoice {
            refuse_join: true,
            ..Default::default()
        });
        let handle = schedule_delivery(
            job(),
            deps(
                FakeBlacklist::default(),
                Arc::new(FakeBlobs::serving(payload(&[b"f1"]))),
                voice,
            ),
            config(),
        );
        assert!(matches!(
            handle.outcome.await.unwrap(),
            DeliveryOutcome::Failed(DeliveryError::Join(_))
        ));
    }

    #[tokio::test]
    async fn truncated_payload_plays_what_it_can_then_fails() {
        let mut bytes = payload(&[b"f1", b"f2"]).to_vec();
        bytes.extend_from_slice(&[0x10, 0x00, 0xAA]);
        let voice = voice();
        let handle = schedule_delivery(
            job(),
            deps(
                FakeBlacklist::default(),
                Arc::new(FakeBlobs::serving(Bytes::from(bytes))),
                Arc::clone(&voice),
            ),
            config(),
        );
        assert!(matches!(
            handle.outcome.await.unwrap(),
            DeliveryOutcome::Failed(DeliveryError::Decode(_))
        ));
        assert_eq!(*voice.played.lock().unwrap(), vec!["f1", "f2"]);
        assert_eq!(
            voice.events.lock().unwrap().last().map(String::as_str),
            Some("disconnect")
        );
    }

    #[tokio::test]
    async fn waits_for_the_fire_time() {
        let mut future_job = job();
        future_job.run_at = Utc::now() + chrono::Duration::milliseconds(300);
        let voice = voice();
        let handle = schedule_delivery(
            future_job,
            deps(
                FakeBlacklist::default(),
                Arc::new(FakeBlobs::serving(payload(&[b"f1"]))),
                Arc::clone(&voice),
            ),
            DeliveryConfig {
                preload_margin: Duration::from_millis(100),
                send_timeout: Duration::from_secs(1),
            },
        );
        let started = std::time::Instant::now();
        assert!(handle.outcome.await.unwrap().is_finished());
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn config_converts_seconds() {
        let config = DeliveryConfig::from(&WorkerConfig::default());
        assert_eq!(config.preload_margin, Duration::from_secs(5));
        assert_eq!(config.send_timeout, Duration::from_secs(60));
    }
}
