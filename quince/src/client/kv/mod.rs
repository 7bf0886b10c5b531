use std::{fmt::Display, num::NonZeroU32, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use quince_proto::{
    headers::{HeaderMap, HeaderName, HeaderValue},
    Subject,
};
use tracing::debug;

use crate::client::{
    AckPolicy, Consumer, ConsumerConfig, ConsumerStreamError, DeliverPolicy, DiscardPolicy,
    JetstreamClient, JetstreamError, StorageType, StreamConfig, StreamMessage,
};

const MAX_HISTORY: u8 = 64;
const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(2 * 60);
const HISTORY_CONSUMER_INACTIVITY: Duration = Duration::from_secs(30);

/// A Key-Value bucket, stored in the `KV_<bucket>` stream
///
/// Obtained from [`JetstreamClient::create_bucket`] or [`JetstreamClient::bucket`].
#[derive(Debug, Clone)]
pub struct Store {
    jetstream: JetstreamClient,
    bucket: String,
    stream_name: String,
    key_prefix: String,
    direct: bool,
}

/// The configuration of a new bucket
#[derive(Debug, Clone)]
pub struct KvConfig {
    pub bucket: String,
    pub description: Option<String>,
    /// How many values are kept for every key, from 1 to 64
    pub history: u8,
    /// How long a value is kept, zero meaning forever
    pub max_age: Duration,
    pub max_bytes: Option<u64>,
    pub max_value_size: Option<u32>,
    pub storage: StorageType,
    pub replicas: NonZeroU32,
}

/// A revision of a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub bucket: String,
    pub key: String,
    pub value: Bytes,
    pub revision: u64,
    pub created: DateTime<Utc>,
    pub operation: Operation,
}

/// What a revision did to its key
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operation {
    Put,
    Delete,
    Purge,
}

/// An error encountered while using a Key-Value bucket
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum KvError {
    #[error("invalid bucket name")]
    InvalidBucket,
    #[error("invalid key")]
    InvalidKey,
    #[error("history must be between 1 and 64, got {0}")]
    InvalidHistory(u8),
    #[error("bucket not found")]
    BucketNotFound,
    #[error("jetstream error")]
    Jetstream(#[source] JetstreamError),
    #[error("history consumer error")]
    Consumer(#[source] ConsumerStreamError),
}

impl KvConfig {
    /// A bucket keeping only the latest value of every key
    #[must_use]
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            description: None,
            history: 1,
            max_age: Duration::ZERO,
            max_bytes: None,
            max_value_size: None,
            storage: StorageType::File,
            replicas: NonZeroU32::MIN,
        }
    }

    fn stream_config(&self) -> Result<StreamConfig, KvError> {
        if !is_valid_bucket(&self.bucket) {
            return Err(KvError::InvalidBucket);
        }
        if !(1..=MAX_HISTORY).contains(&self.history) {
            return Err(KvError::InvalidHistory(self.history));
        }

        let subjects = vec![Subject::try_from(format!("$KV.{}.>", self.bucket))
            .map_err(|_| KvError::InvalidBucket)?];
        let duplicate_window = if self.max_age.is_zero() {
            DEFAULT_DUPLICATE_WINDOW
        } else {
            self.max_age.min(DEFAULT_DUPLICATE_WINDOW)
        };

        Ok(StreamConfig {
            description: self.description.clone(),
            max_age: self.max_age,
            max_bytes: self.max_bytes,
            max_messages_per_subject: Some(u64::from(self.history)),
            max_message_size: self.max_value_size,
            discard_policy: DiscardPolicy::New,
            storage: self.storage,
            replicas: self.replicas,
            duplicate_window,
            allow_direct: true,
            allow_rollup: true,
            allow_delete: true,
            allow_purge: true,
            ..StreamConfig::new(format!("KV_{}", self.bucket), subjects)
        })
    }
}

impl JetstreamClient {
    /// Create a Key-Value bucket
    ///
    /// # Errors
    ///
    /// It returns an error if the configuration is invalid, if a different
    /// bucket with the same name exists or if the request fails.
    pub async fn create_bucket(&self, config: &KvConfig) -> Result<Store, KvError> {
        let stream = self
            .create_stream(&config.stream_config()?)
            .await
            .map_err(KvError::Jetstream)?;
        debug!(bucket = %config.bucket, "created bucket");
        Ok(Store::new(
            self.clone(),
            &config.bucket,
            stream.config.allow_direct,
        ))
    }

    /// Open an existing Key-Value bucket
    ///
    /// # Errors
    ///
    /// It returns an error if the bucket doesn't exist or if the request fails.
    pub async fn bucket(&self, bucket: impl Display) -> Result<Store, KvError> {
        let bucket = bucket.to_string();
        if !is_valid_bucket(&bucket) {
            return Err(KvError::InvalidBucket);
        }

        let stream = self
            .stream(format!("KV_{bucket}"))
            .await
            .map_err(KvError::Jetstream)?
            .ok_or(KvError::BucketNotFound)?;
        Ok(Store::new(self.clone(), &bucket, stream.config.allow_direct))
    }
}

impl Store {
    fn new(jetstream: JetstreamClient, bucket: &str, direct: bool) -> Self {
        Self {
            jetstream,
            bucket: bucket.to_owned(),
            stream_name: format!("KV_{bucket}"),
            key_prefix: format!("$KV.{bucket}."),
            direct,
        }
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Store `value` under `key`, returning the new revision
    ///
    /// # Errors
    ///
    /// It returns an error if `key` is invalid or if the request fails.
    pub async fn put(&self, key: &str, value: Bytes) -> Result<u64, KvError> {
        self.publish(key, HeaderMap::new(), value).await
    }

    /// The current value of `key`
    ///
    /// Returns `None` if the key never existed or was deleted or purged.
    ///
    /// # Errors
    ///
    /// It returns an error if `key` is invalid or if the request fails.
    pub async fn get(&self, key: &str) -> Result<Option<Entry>, KvError> {
        Ok(self
            .entry(key)
            .await?
            .filter(|entry| entry.operation == Operation::Put))
    }

    /// The latest revision of `key`, including delete and purge markers
    ///
    /// # Errors
    ///
    /// It returns an error if `key` is invalid or if the request fails.
    pub async fn entry(&self, key: &str) -> Result<Option<Entry>, KvError> {
        let subject = self.subject_for(key)?;
        let message = if self.direct {
            self.jetstream
                .direct_get_last(&self.stream_name, &subject)
                .await
        } else {
            self.jetstream
                .get_last_message(&self.stream_name, &subject)
                .await
        }
        .map_err(KvError::Jetstream)?;

        message.map(|message| self.entry_from(message)).transpose()
    }

    /// Mark `key` as deleted, keeping its history
    ///
    /// # Errors
    ///
    /// It returns an error if `key` is invalid or if the request fails.
    pub async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::KV_OPERATION, HeaderValue::from_static("DEL"));
        self.publish(key, headers, Bytes::new()).await.map(drop)
    }

    /// Mark `key` as purged, dropping every older revision
    ///
    /// # Errors
    ///
    /// It returns an error if `key` is invalid or if the request fails.
    pub async fn purge(&self, key: &str) -> Result<(), KvError> {
        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::KV_OPERATION, HeaderValue::from_static("PURGE"));
        headers.insert(HeaderName::ROLLUP, HeaderValue::from_static("sub"));
        self.publish(key, headers, Bytes::new()).await.map(drop)
    }

    /// Every revision of `key` still held by the bucket, oldest first
    ///
    /// # Errors
    ///
    /// It returns an error if `key` is invalid or if the request fails.
    pub async fn history(&self, key: &str) -> Result<Vec<Entry>, KvError> {
        let subject = self.subject_for(key)?;
        let config = ConsumerConfig {
            deliver_policy: DeliverPolicy::All,
            ack_policy: AckPolicy::None,
            filter_subjects: vec![subject],
            inactive_threshold: HISTORY_CONSUMER_INACTIVITY,
            memory_storage: true,
            ..ConsumerConfig::default()
        };
        let consumer = self
            .jetstream
            .create_consumer(&self.stream_name, &config)
            .await
            .map_err(KvError::Jetstream)?;

        let entries = self.pull_history(&consumer).await;
        let deleted = self
            .jetstream
            .delete_consumer(&self.stream_name, &consumer.name)
            .await
            .map_err(KvError::Jetstream);
        let entries = entries?;
        deleted?;
        Ok(entries)
    }

    async fn pull_history(&self, consumer: &Consumer) -> Result<Vec<Entry>, KvError> {
        let mut entries = Vec::new();
        if consumer.num_pending == 0 {
            return Ok(entries);
        }

        let max_msgs = usize::try_from(consumer.num_pending).unwrap_or(usize::MAX);
        let mut batch = Box::pin(
            self.jetstream
                .consumer_batch(consumer, Duration::ZERO, max_msgs)
                .await
                .map_err(KvError::Jetstream)?,
        );
        while let Some(message) = batch.next().await {
            let message = message.map_err(KvError::Consumer)?;
            let message = StreamMessage::from_pulled(message).map_err(KvError::Jetstream)?;
            entries.push(self.entry_from(message)?);
        }
        Ok(entries)
    }

    async fn publish(&self, key: &str, headers: HeaderMap, value: Bytes) -> Result<u64, KvError> {
        let subject = self.subject_for(key)?;
        let ack = self
            .jetstream
            .publish(subject, headers, value)
            .await
            .map_err(KvError::Jetstream)?;
        Ok(ack.sequence)
    }

    fn subject_for(&self, key: &str) -> Result<Subject, KvError> {
        if !is_valid_key(key) {
            return Err(KvError::InvalidKey);
        }

        Subject::try_from(format!("{}{key}", self.key_prefix)).map_err(|_| KvError::InvalidKey)
    }

    fn entry_from(&self, message: StreamMessage) -> Result<Entry, KvError> {
        let key = message
            .subject
            .strip_prefix(self.key_prefix.as_str())
            .ok_or(KvError::Jetstream(JetstreamError::MalformedResponse))?
            .to_owned();
        let operation = match message
            .headers
            .get(&HeaderName::KV_OPERATION)
            .map(HeaderValue::as_str)
        {
            Some("DEL") => Operation::Delete,
            Some("PURGE") => Operation::Purge,
            _ => Operation::Put,
        };

        Ok(Entry {
            bucket: self.bucket.clone(),
            key,
            value: message.payload,
            revision: message.sequence,
            created: message.timestamp,
            operation,
        })
    }
}

fn is_valid_bucket(bucket: &str) -> bool {
    !bucket.is_empty()
        && bucket
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('.')
        && !key.ends_with('.')
        && !key.contains("..")
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-/_=.".contains(&b))
}
