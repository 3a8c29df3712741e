use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadReply};
use redis::Value;
use tracing::{debug, error, info, warn};

use soundcron_core::{dispatch::Dispatcher, error::WireError, CoreError, DispatchedJob};

use crate::error::{QueueError, Result};

/// Create the stream and its consumer group if either is missing.
///
/// Safe to race from several processes: an existing group is not an error.
pub async fn ensure_group(conn: &mut MultiplexedConnection, stream: &str, group: &str) -> Result<()> {
    let created: redis::RedisResult<()> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream)
        .arg(group)
        .arg("$")
        .arg("MKSTREAM")
        .query_async(conn)
        .await;
    match created {
        Ok(()) => {
            info!(stream, group, "consumer group created");
            Ok(())
        }
        Err(e) if e.code() == Some("BUSYGROUP") => {
            debug!(stream, group, "consumer group already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Producer side of the work queue: one XADD per job.
pub struct RedisStreamDispatcher {
    conn: MultiplexedConnection,
    stream: String,
}

impl RedisStreamDispatcher {
    pub async fn connect(client: &redis::Client, stream: &str, group: &str) -> Result<Self> {
        let mut conn = client.get_multiplexed_async_connection().await?;
        ensure_group(&mut conn, stream, group).await?;
        Ok(Self {
            conn,
            stream: stream.to_string(),
        })
    }

    async fn enqueue(&self, job: &DispatchedJob) -> Result<String> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream).arg("*");
        for (field, value) in job.to_fields() {
            cmd.arg(field).arg(value);
        }
        Ok(cmd.query_async(&mut conn).await?)
    }
}

#[async_trait]
impl Dispatcher for RedisStreamDispatcher {
    /// Messages are added independently; one failed XADD does not undo the others.
    async fn dispatch(&self, jobs: &[DispatchedJob]) -> soundcron_core::Result<()> {
        let mut failed = 0usize;
        for job in jobs {
            match self.enqueue(job).await {
                Ok(entry_id) => debug!(
                    soundcron_id = %job.soundcron_id,
                    run_at = %job.run_at,
                    entry_id,
                    "job enqueued"
                ),
                Err(e) => {
                    failed += 1;
                    error!(
                        soundcron_id = %job.soundcron_id,
                        job_name = %job.name,
                        guild_id = %job.guild_id,
                        run_at = %job.run_at,
                        target_channel_id = %job.target_channel_id,
                        "enqueue failed: {e}"
                    );
                }
            }
        }
        if failed > 0 {
            return Err(CoreError::Dispatch(format!(
                "{failed} of {} job(s) could not be enqueued",
                jobs.len()
            )));
        }
        Ok(())
    }
}

/// Consumer side of the work queue.
#[async_trait]
pub trait JobReceiver: Send {
    /// Wait for the next batch of jobs. Never returns an empty batch.
    async fn receive_jobs(&mut self) -> Result<Vec<DispatchedJob>>;
}

/// Reads the stream as one named consumer of the shared group.
///
/// Parsed messages are acknowledged before they are returned, and returned
/// even when the acknowledgement fails. Messages that fail to parse are
/// logged and left pending.
pub struct RedisJobReceiver {
    conn: MultiplexedConnection,
    stream: String,
    group: String,
    consumer: String,
    count: usize,
}

impl RedisJobReceiver {
    /// Opens a dedicated connection; `XREADGROUP ... BLOCK 0` holds it until
    /// messages arrive.
    pub async fn connect(
        client: &redis::Client,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Self> {
        let mut conn = client.get_multiplexed_async_connection().await?;
        ensure_group(&mut conn, stream, group).await?;
        info!(stream, group, consumer, "job receiver connected");
        Ok(Self {
            conn,
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            count: count.max(1),
        })
    }
}

/// Group reads and acknowledgements, apart from the job decoding done on top.
#[async_trait]
trait GroupReader: Send {
    fn stream(&self) -> &str;

    /// Block for the next batch of new entries delivered to this consumer.
    async fn read_batch(&mut self) -> Result<Vec<StreamId>>;

    async fn ack(&mut self, entry_id: &str) -> Result<()>;
}

#[async_trait]
impl GroupReader for RedisJobReceiver {
    fn stream(&self) -> &str {
        &self.stream
    }

    async fn read_batch(&mut self) -> Result<Vec<StreamId>> {
        let reply: StreamReadReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(self.count)
            .arg("BLOCK")
            .arg(0)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut self.conn)
            .await?;
        Ok(reply.keys.into_iter().flat_map(|k| k.ids).collect())
    }

    async fn ack(&mut self, entry_id: &str) -> Result<()> {
        let _: i64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(entry_id)
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobReceiver for RedisJobReceiver {
    async fn receive_jobs(&mut self) -> Result<Vec<DispatchedJob>> {
        receive_from(self).await
    }
}

/// Read until at least one entry decodes. Decoded entries are acknowledged
/// and returned; a failed XACK is logged and the job is still returned.
/// Malformed entries stay pending.
async fn receive_from<R: GroupReader>(reader: &mut R) -> Result<Vec<DispatchedJob>> {
    loop {
        let entries = reader.read_batch().await?;
        let mut jobs = Vec::new();
        for entry in entries {
            match decode_entry(&entry) {
                Ok(job) => {
                    if let Err(e) = reader.ack(&entry.id).await {
                        warn!(
                            stream = %reader.stream(),
                            entry_id = %entry.id,
                            soundcron_id = %job.soundcron_id,
                            job_name = %job.name,
                            run_at = %job.run_at,
                            "ack failed, delivering anyway: {e}"
                        );
                    }
                    jobs.push(job);
                }
                Err(e) => warn!(
                    stream = %reader.stream(),
                    "{}",
                    QueueError::Wire {
                        entry_id: entry.id.clone(),
                        source: e,
                    }
                ),
            }
        }
        if !jobs.is_empty() {
            return Ok(jobs);
        }
    }
}

/// Decode one stream entry. Values that are not byte strings count as missing.
pub fn decode_entry(entry: &StreamId) -> std::result::Result<DispatchedJob, WireError> {
    let fields: HashMap<String, Vec<u8>> = entry
        .map
        .iter()
        .filter_map(|(k, v)| value_bytes(v).map(|b| (k.clone(), b)))
        .collect();
    DispatchedJob::from_fields(&fields)
}

fn value_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::BulkString(bytes) => Some(bytes.clone()),
        Value::SimpleString(s) => Some(s.clone().into_bytes()),
        Value::Int(i) => Some(i.to_string().into_bytes()),
        _ => None,
    }
}
