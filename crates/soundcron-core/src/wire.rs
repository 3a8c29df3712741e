//! Work-queue wire schema for [`DispatchedJob`].
//!
//! Every field travels as a string. `runAt` uses RFC 3339 in UTC with as many
//! fractional digits as the value needs, so parse(format(t)) == t exactly.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::WireError;
use crate::types::DispatchedJob;

pub const FIELD_JOB_NAME: &str = "jobName";
pub const FIELD_SOUNDCRON_ID: &str = "soundCronID";
pub const FIELD_GUILD_ID: &str = "guildID";
pub const FIELD_RUN_AT: &str = "runAt";
pub const FIELD_TARGET_CHANNEL_ID: &str = "targetChannelID";

pub fn format_run_at(run_at: DateTime<Utc>) -> String {
    run_at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn parse_run_at(raw: &str) -> Result<DateTime<Utc>, WireError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WireError::InvalidRunAt {
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

impl DispatchedJob {
    /// Field/value pairs in the order they are written to the stream.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (FIELD_JOB_NAME, self.name.clone()),
            (FIELD_SOUNDCRON_ID, self.soundcron_id.clone()),
            (FIELD_GUILD_ID, self.guild_id.clone()),
            (FIELD_RUN_AT, format_run_at(self.run_at)),
            (FIELD_TARGET_CHANNEL_ID, self.target_channel_id.clone()),
        ]
    }

    /// Validate and decode a stream message. Every field is required.
    pub fn from_fields<V: AsRef<[u8]>>(fields: &HashMap<String, V>) -> Result<Self, WireError> {
        let run_at = parse_run_at(&required(fields, FIELD_RUN_AT)?)?;
        Ok(Self {
            name: required(fields, FIELD_JOB_NAME)?,
            soundcron_id: required(fields, FIELD_SOUNDCRON_ID)?,
            guild_id: required(fields, FIELD_GUILD_ID)?,
            run_at,
            target_channel_id: required(fields, FIELD_TARGET_CHANNEL_ID)?,
        })
    }
}

fn required<V: AsRef<[u8]>>(
    fields: &HashMap<String, V>,
    key: &'static str,
) -> Result<String, WireError> {
    let raw = fields.get(key).ok_or(WireError::MissingField(key))?;
    std::str::from_utf8(raw.as_ref())
        .map(str::to_string)
        .map_err(|_| WireError::NotAString(key))
}
