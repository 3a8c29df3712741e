use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use soundcron_queue::JobReceiver;

use crate::delivery::{schedule_delivery, DeliveryConfig, DeliveryDeps};

const RECEIVE_RETRY: Duration = Duration::from_secs(1);

/// Pulls jobs off the queue and schedules a delivery for each one.
pub struct Worker<R> {
    receiver: R,
    deps: DeliveryDeps,
    config: DeliveryConfig,
}

impl<R: JobReceiver> Worker<R> {
    pub fn new(receiver: R, deps: DeliveryDeps, config: DeliveryConfig) -> Self {
        Self {
            receiver,
            deps,
            config,
        }
    }

    /// Receive until `shutdown` broadcasts `true`.
    ///
    /// Deliveries already scheduled are not tracked; each one logs its own
    /// outcome. A receive error is logged and retried after a short pause.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("worker started");
        loop {
            tokio::select! {
                received = self.receiver.receive_jobs() => match received {
                    Ok(jobs) => {
                        for job in jobs {
                            schedule_delivery(job, self.deps.clone(), self.config);
                        }
                    }
                    Err(e) => {
                        error!("receiving jobs failed: {e}");
                        tokio::time::sleep(RECEIVE_RETRY).await;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Arc;

    use soundcron_core::DispatchedJob;

    use crate::delivery::tests::{job, payload, FakeBlacklist, FakeBlobs, FakeVoice};
    use crate::dry_run::{DryRunBlobs, DryRunVoice};

    /// Hands out the queued batches, then blocks forever like an idle stream.
    struct ScriptedReceiver {
        batches: VecDeque<Vec<DispatchedJob>>,
    }

    #[async_trait]
    impl JobReceiver for ScriptedReceiver {
        async fn receive_jobs(&mut self) -> soundcron_queue::Result<Vec<DispatchedJob>> {
            match self.batches.pop_front() {
                Some(batch) => Ok(batch),
                None => std::future::pending().await,
            }
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn received_jobs_are_delivered() {
        let mut second = job();
        second.soundcron_id = "sc-2".into();
        second.target_channel_id = "C2".into();

        let voice = Arc::new(FakeVoice {
            capacity: 8,
            ..Default::default()
        });
        let deps = DeliveryDeps {
            blacklist: Arc::new(FakeBlacklist::default()),
            blobs: Arc::new(FakeBlobs::serving(payload(&[b"f1"]))),
            voice: voice.clone(),
        };
        let receiver = ScriptedReceiver {
            batches: VecDeque::from(vec![vec![job(), second]]),
        };
        let config = DeliveryConfig {
            preload_margin: Duration::from_secs(5),
            send_timeout: Duration::from_secs(1),
        };

        let (tx, rx) = watch::channel(false);
        let worker = tokio::spawn(Worker::new(receiver, deps, config).run(rx));

        wait_for(|| {
            voice
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| *e == "disconnect")
                .count()
                == 2
        })
        .await;
        let mut joins: Vec<_> = voice
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("join"))
            .cloned()
            .collect();
        joins.sort();
        assert_eq!(joins, vec!["join G1/C1", "join G1/C2"]);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn dry_run_collaborators_finish_cleanly() {
        let deps = DeliveryDeps {
            blacklist: Arc::new(FakeBlacklist::default()),
            blobs: Arc::new(DryRunBlobs),
            voice: Arc::new(DryRunVoice),
        };
        let handle = schedule_delivery(
            job(),
            deps,
            DeliveryConfig {
                preload_margin: Duration::from_secs(5),
                send_timeout: Duration::from_secs(1),
            },
        );
        assert!(handle.outcome.await.unwrap().is_finished());
    }
}
