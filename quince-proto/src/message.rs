use bytes::Bytes;

use crate::{headers::HeaderMap, StatusCode, Subject, SubscriptionId};

/// The parts of a message shared by publishes and deliveries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBase {
    pub subject: Subject,
    pub reply_subject: Option<Subject>,
    pub headers: HeaderMap,
    pub payload: Bytes,
}

/// A message delivered by the server through `MSG` or `HMSG`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    pub status_code: Option<StatusCode>,
    pub subscription_id: SubscriptionId,
    pub base: MessageBase,
}

impl MessageBase {
    /// Bytes counted against the server's `max_payload`: headers plus payload
    #[must_use]
    pub fn wire_payload_len(&self) -> usize {
        self.headers.encoded_len() + self.payload.len()
    }

    /// Checks the message against the server's maximum payload size
    ///
    /// # Errors
    ///
    /// Returns an error if the headers and payload together exceed `max_payload`.
    pub fn check_payload_len(&self, max_payload: usize) -> Result<(), PayloadTooLargeError> {
        let len = self.wire_payload_len();
        if len > max_payload {
            Err(PayloadTooLargeError {
                len,
                max: max_payload,
            })
        } else {
            Ok(())
        }
    }
}

impl ServerMessage {
    /// Returns `true` for the empty `503` status the server sends back
    /// when a request had no subscribers
    #[must_use]
    pub fn is_no_responders(&self) -> bool {
        self.status_code == Some(StatusCode::NO_RESPONDERS) && self.base.payload.is_empty()
    }
}

/// The message is larger than the server accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("message is {len} bytes but the server accepts at most {max}")]
pub struct PayloadTooLargeError {
    pub len: usize,
    pub max: usize,
}
