use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use quince_proto::Subject;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use super::{duration, nullable_number};

/// A Jetstream pull consumer
#[derive(Debug, Clone, Deserialize)]
pub struct Consumer {
    pub stream_name: String,
    pub name: String,
    pub config: ConsumerConfig,
    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,
    /// Messages matching the consumer that weren't delivered yet
    #[serde(default)]
    pub num_pending: u64,
}

/// A Jetstream pull consumer configuration
#[derive(Debug, Clone, Default)]
pub struct ConsumerConfig {
    pub durability: ConsumerDurability,
    /// Empty for ephemeral consumers that should get a generated name
    pub name: String,
    pub description: String,
    pub deliver_policy: DeliverPolicy,
    pub ack_policy: AckPolicy,
    pub max_deliver: Option<u32>,
    pub filter_subjects: Vec<Subject>,
    pub headers_only: bool,
    pub max_waiting: Option<u32>,
    /// How long an idle consumer lives before the server removes it
    pub inactive_threshold: Duration,
    pub memory_storage: bool,
    pub metadata: BTreeMap<String, String>,
}

/// The durability of the consumer
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum ConsumerDurability {
    /// Removed by the server once inactive
    #[default]
    Ephemeral,
    Durable,
}

/// The delivery policy of the consumer
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "deliver_policy")]
pub enum DeliverPolicy {
    #[default]
    #[serde(rename = "all")]
    All,
    #[serde(rename = "last")]
    Last,
    #[serde(rename = "last_per_subject")]
    LastPerSubject,
    #[serde(rename = "new")]
    New,
    #[serde(rename = "by_start_sequence")]
    StartSequence {
        #[serde(rename = "opt_start_seq")]
        sequence: u64,
    },
    #[serde(rename = "by_start_time")]
    StartTime {
        #[serde(rename = "opt_start_time")]
        from: DateTime<Utc>,
    },
}

/// The acknowledgment policy of the consumer
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ack_policy", rename_all = "lowercase")]
pub enum AckPolicy {
    Explicit {
        #[serde(rename = "ack_wait", with = "duration")]
        wait: Duration,
        #[serde(
            rename = "max_ack_pending",
            with = "nullable_number",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        max_pending: Option<u32>,
    },
    All {
        #[serde(rename = "ack_wait", with = "duration")]
        wait: Duration,
        #[serde(
            rename = "max_ack_pending",
            with = "nullable_number",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        max_pending: Option<u32>,
    },
    None,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawConsumerConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    durable_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    description: String,

    #[serde(flatten)]
    deliver_policy: DeliverPolicy,
    #[serde(flatten)]
    ack_policy: AckPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "nullable_number")]
    max_deliver: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    filter_subject: Option<Subject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    filter_subjects: Vec<Subject>,
    #[serde(default)]
    headers_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_waiting: Option<u32>,

    #[serde(default, skip_serializing_if = "Duration::is_zero", with = "duration")]
    inactive_threshold: Duration,
    #[serde(default, rename = "mem_storage")]
    memory_storage: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, String>,
}

impl Serialize for ConsumerConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let durable_name = match self.durability {
            ConsumerDurability::Ephemeral => String::new(),
            ConsumerDurability::Durable => self.name.clone(),
        };

        let (filter_subject, filter_subjects) = match self.filter_subjects.as_slice() {
            [single] => (Some(single.clone()), Vec::new()),
            many => (None, many.to_vec()),
        };

        RawConsumerConfig {
            name: self.name.clone(),
            durable_name,
            description: self.description.clone(),
            deliver_policy: self.deliver_policy,
            ack_policy: self.ack_policy,
            max_deliver: self.max_deliver,
            filter_subject,
            filter_subjects,
            headers_only: self.headers_only,
            max_waiting: self.max_waiting,
            inactive_threshold: self.inactive_threshold,
            memory_storage: self.memory_storage,
            metadata: self.metadata.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ConsumerConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let RawConsumerConfig {
            name,
            durable_name,
            description,
            deliver_policy,
            ack_policy,
            max_deliver,
            filter_subject,
            filter_subjects,
            headers_only,
            max_waiting,
            inactive_threshold,
            memory_storage,
            metadata,
        } = RawConsumerConfig::deserialize(deserializer)?;
        let (durability, name) = if !durable_name.is_empty() {
            (ConsumerDurability::Durable, durable_name)
        } else if !name.is_empty() {
            (ConsumerDurability::Ephemeral, name)
        } else {
            return Err(de::Error::custom(
                "consumer neither has a name or a durable name",
            ));
        };

        let filter_subjects = match filter_subject {
            Some(filter_subject) => vec![filter_subject],
            None => filter_subjects,
        };

        Ok(Self {
            durability,
            name,
            description,
            deliver_policy,
            ack_policy,
            max_deliver,
            filter_subjects,
            headers_only,
            max_waiting,
            inactive_threshold,
            memory_storage,
            metadata,
        })
    }
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self::Explicit {
            wait: Duration::from_secs(30),
            max_pending: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use quince_proto::Subject;
    use serde_json::json;

    use super::{AckPolicy, ConsumerConfig, ConsumerDurability, DeliverPolicy};

    #[test]
    fn serialize_ephemeral_filtered() {
        let config = ConsumerConfig {
            filter_subjects: vec![Subject::from_static("$KV.colors.sky")],
            deliver_policy: DeliverPolicy::LastPerSubject,
            ack_policy: AckPolicy::None,
            inactive_threshold: Duration::from_secs(5),
            ..ConsumerConfig::default()
        };

        assert_eq!(
            json!({
                "deliver_policy": "last_per_subject",
                "ack_policy": "none",
                "filter_subject": "$KV.colors.sky",
                "headers_only": false,
                "inactive_threshold": 5_000_000_000_u64,
                "mem_storage": false
            }),
            serde_json::to_value(&config).unwrap()
        );
    }

    #[test]
    fn deserialize_durable() {
        let config = serde_json::from_value::<ConsumerConfig>(json!({
            "durable_name": "worker",
            "name": "worker",
            "deliver_policy": "by_start_sequence",
            "opt_start_seq": 10,
            "ack_policy": "explicit",
            "ack_wait": 30_000_000_000_u64,
            "max_ack_pending": -1,
            "max_deliver": -1,
            "filter_subjects": ["orders.eu", "orders.us"],
            "replay_policy": "instant",
            "num_replicas": 0
        }))
        .unwrap();

        assert_eq!(ConsumerDurability::Durable, config.durability);
        assert_eq!("worker", config.name);
        assert_eq!(DeliverPolicy::StartSequence { sequence: 10 }, config.deliver_policy);
        assert_eq!(
            AckPolicy::Explicit {
                wait: Duration::from_secs(30),
                max_pending: None
            },
            config.ack_policy
        );
        assert_eq!(None, config.max_deliver);
        assert_eq!(2, config.filter_subjects.len());
    }

    #[test]
    fn nameless_config_is_rejected() {
        assert!(serde_json::from_value::<ConsumerConfig>(json!({
            "deliver_policy": "all",
            "ack_policy": "none"
        }))
        .is_err());
    }
}
