use bytes::Bytes;
use chrono::{DateTime, Utc};
use data_encoding::BASE64;
use quince_proto::{
    headers::{HeaderMap, HeaderName},
    proto::decode_header_block,
    ServerMessage, Subject,
};
use serde::Deserialize;

use crate::client::JetstreamError;

/// A message stored in a stream
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub subject: Subject,
    pub sequence: u64,
    pub headers: HeaderMap,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

/// The acknowledgment of a message stored by Jetstream
#[derive(Debug, Clone, Deserialize)]
pub struct PubAck {
    /// The stream the message was stored into
    pub stream: String,
    #[serde(rename = "seq")]
    pub sequence: u64,
    /// `true` if the message was already stored within the duplicate window
    #[serde(default)]
    pub duplicate: bool,
    #[serde(default)]
    pub domain: Option<String>,
}

/// A stored message as returned by `STREAM.MSG.GET`, base64 encoded
#[derive(Debug, Deserialize)]
pub(crate) struct RawStreamMessage {
    subject: Subject,
    seq: u64,
    #[serde(default)]
    hdrs: Option<String>,
    #[serde(default)]
    data: Option<String>,
    time: DateTime<Utc>,
}

impl RawStreamMessage {
    pub(crate) fn decode(self) -> Result<StreamMessage, JetstreamError> {
        let headers = match self.hdrs {
            Some(hdrs) if !hdrs.is_empty() => {
                let block = Bytes::from(base64(&hdrs)?);
                decode_header_block(&block)
                    .map_err(|_| JetstreamError::MalformedResponse)?
                    .1
            }
            _ => HeaderMap::new(),
        };
        let payload = match self.data {
            Some(data) => Bytes::from(base64(&data)?),
            None => Bytes::new(),
        };

        Ok(StreamMessage {
            subject: self.subject,
            sequence: self.seq,
            headers,
            payload,
            timestamp: self.time,
        })
    }
}

impl StreamMessage {
    /// Rebuilds a message answered by the direct get API
    ///
    /// The stored subject, sequence and timestamp travel in headers.
    pub(crate) fn from_direct(message: ServerMessage) -> Result<Self, JetstreamError> {
        let mut headers = message.base.headers;
        let subject = headers
            .get(&HeaderName::SUBJECT)
            .and_then(|subject| Subject::try_from(subject.as_str()).ok())
            .ok_or(JetstreamError::MalformedResponse)?;
        let sequence = headers
            .get(&HeaderName::SEQUENCE)
            .and_then(|sequence| sequence.as_str().parse::<u64>().ok())
            .ok_or(JetstreamError::MalformedResponse)?;
        let timestamp = headers
            .get(&HeaderName::TIMESTAMP)
            .and_then(|timestamp| DateTime::parse_from_rfc3339(timestamp.as_str()).ok())
            .ok_or(JetstreamError::MalformedResponse)?
            .with_timezone(&Utc);

        for name in [
            HeaderName::STREAM,
            HeaderName::SUBJECT,
            HeaderName::SEQUENCE,
            HeaderName::TIMESTAMP,
        ] {
            headers.remove(&name);
        }

        Ok(Self {
            subject,
            sequence,
            headers,
            payload: message.base.payload,
            timestamp,
        })
    }
}

impl StreamMessage {
    /// Rebuilds a message delivered by a pull consumer
    ///
    /// The stream sequence and timestamp are part of the ack subject, either
    /// `$JS.ACK.<stream>.<consumer>.<delivered>.<stream seq>.<consumer seq>.<nanos>.<pending>`
    /// or the longer form that also carries the domain and account hash.
    pub(crate) fn from_pulled(message: ServerMessage) -> Result<Self, JetstreamError> {
        let reply_subject = message
            .base
            .reply_subject
            .as_ref()
            .ok_or(JetstreamError::MalformedResponse)?;
        let tokens = reply_subject.split('.').collect::<Vec<_>>();
        let first = match tokens.as_slice() {
            ["$JS", "ACK", rest @ ..] if rest.len() == 7 => 2,
            ["$JS", "ACK", rest @ ..] if rest.len() >= 9 => 4,
            _ => return Err(JetstreamError::MalformedResponse),
        };
        let sequence = tokens[first + 3]
            .parse::<u64>()
            .map_err(|_| JetstreamError::MalformedResponse)?;
        let nanos = tokens[first + 5]
            .parse::<i64>()
            .map_err(|_| JetstreamError::MalformedResponse)?;

        Ok(Self {
            subject: message.base.subject,
            sequence,
            headers: message.base.headers,
            payload: message.base.payload,
            timestamp: DateTime::from_timestamp_nanos(nanos),
        })
    }
}

fn base64(encoded: &str) -> Result<Vec<u8>, JetstreamError> {
    BASE64
        .decode(encoded.as_bytes())
        .map_err(|_| JetstreamError::MalformedResponse)
}
