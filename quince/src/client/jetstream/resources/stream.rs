use std::{num::NonZeroU32, time::Duration};

use chrono::{DateTime, Utc};
use quince_proto::Subject;
use serde::{Deserialize, Serialize};

use super::{duration, nullable_datetime, nullable_number, opposite_bool};

/// A Jetstream stream
#[derive(Debug, Clone, Deserialize)]
pub struct Stream {
    pub config: StreamConfig,
    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,
    pub state: StreamState,
}

/// The state of the stream
#[derive(Debug, Clone, Deserialize)]
pub struct StreamState {
    pub messages: u64,
    pub bytes: u64,
    #[serde(rename = "first_seq")]
    pub first_sequence: u64,
    #[serde(with = "nullable_datetime", rename = "first_ts")]
    pub first_sequence_timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "last_seq")]
    pub last_sequence: u64,
    #[serde(with = "nullable_datetime", rename = "last_ts")]
    pub last_sequence_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consumer_count: u32,
}

/// A Jetstream stream configuration
///
/// Start from [`StreamConfig::new`] and adjust the fields that matter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "it is the actual config of a Jetstream"
)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<Subject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub retention: RetentionPolicy,
    #[serde(with = "nullable_number")]
    pub max_consumers: Option<u32>,
    #[serde(with = "nullable_number", rename = "max_msgs")]
    pub max_messages: Option<u64>,
    #[serde(with = "nullable_number")]
    pub max_bytes: Option<u64>,
    #[serde(with = "duration")]
    pub max_age: Duration,
    #[serde(with = "nullable_number", rename = "max_msgs_per_subject")]
    pub max_messages_per_subject: Option<u64>,
    #[serde(with = "nullable_number", rename = "max_msg_size")]
    pub max_message_size: Option<u32>,
    #[serde(rename = "discard")]
    pub discard_policy: DiscardPolicy,
    pub storage: StorageType,
    #[serde(rename = "num_replicas")]
    pub replicas: NonZeroU32,
    #[serde(with = "duration")]
    pub duplicate_window: Duration,
    pub allow_direct: bool,
    #[serde(rename = "allow_rollup_hdrs")]
    pub allow_rollup: bool,
    #[serde(with = "opposite_bool", rename = "deny_delete")]
    pub allow_delete: bool,
    #[serde(with = "opposite_bool", rename = "deny_purge")]
    pub allow_purge: bool,
    pub sealed: bool,
}

/// A streams retention policy
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    Limits,
    Interest,
    #[serde(rename = "workqueue")]
    WorkQueue,
}

/// What a stream does when it reaches one of its limits
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardPolicy {
    /// Remove the oldest messages to make room
    #[default]
    Old,
    /// Refuse new messages
    New,
}

/// Whether the stream is stored on disk or in memory
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

impl StreamConfig {
    /// A stream capturing `subjects` with no limits
    #[must_use]
    pub fn new(name: impl Into<String>, subjects: Vec<Subject>) -> Self {
        Self {
            name: name.into(),
            subjects,
            ..Self::default()
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            subjects: Vec::new(),
            description: None,
            retention: RetentionPolicy::Limits,
            max_consumers: None,
            max_messages: None,
            max_bytes: None,
            max_age: Duration::ZERO,
            max_messages_per_subject: None,
            max_message_size: None,
            discard_policy: DiscardPolicy::Old,
            storage: StorageType::File,
            replicas: NonZeroU32::MIN,
            duplicate_window: Duration::from_secs(120),
            allow_direct: false,
            allow_rollup: false,
            allow_delete: true,
            allow_purge: true,
            sealed: false,
        }
    }
}
