use std::{fmt::Display, time::Duration};

use bytes::Bytes;
use quince_proto::{
    error::SubjectValidateError, headers::HeaderMap, ServerMessage, StatusCode, Subject,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

pub use self::commands::{ConsumerBatch, ConsumerStream, ConsumerStreamError, Consumers, Streams};
pub use self::resources::{
    AckPolicy, Consumer, ConsumerConfig, ConsumerDurability, DeliverPolicy, DiscardPolicy, PubAck,
    RetentionPolicy, StorageType, Stream, StreamConfig, StreamMessage, StreamState,
};
use self::resources::Response;
use crate::core::Client;

use super::{PublishError, ResponseError};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

mod commands;
mod resources;

/// A NATS Jetstream client
///
/// `JetstreamClient` is a `Clone`able handle to a NATS [`Client`],
/// with Jetstream specific configurations.
#[derive(Debug, Clone)]
pub struct JetstreamClient {
    client: Client,
    prefix: Subject,
    request_timeout: Duration,
}

/// An error returned by the Jetstream API
#[derive(Debug, Clone, Deserialize, thiserror::Error)]
#[error("jetstream error status={status} code={code}: {description}")]
pub struct JetstreamApiError {
    #[serde(rename = "code")]
    status: StatusCode,
    #[serde(rename = "err_code", default)]
    code: JetstreamErrorCode,
    #[serde(default)]
    description: String,
}

/// The type of error encountered while processing a Jetstream request
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JetstreamErrorCode(u16);

/// An error encountered while making a Jetstream request
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum JetstreamError {
    #[error("invalid subject")]
    Subject(#[source] SubjectValidateError),
    #[error("couldn't send the request")]
    Publish(#[source] PublishError),
    #[error("request failure")]
    Response(#[source] ResponseError),
    #[error("JSON serialization")]
    Json(#[source] serde_json::Error),
    #[error("jetstream API error")]
    Api(#[source] JetstreamApiError),
    #[error("malformed response")]
    MalformedResponse,
}

#[derive(Debug, Deserialize)]
struct SuccessResponse {
    success: bool,
}

#[derive(Debug, Deserialize)]
struct PurgeResponse {
    success: bool,
    #[serde(default)]
    purged: u64,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    message: resources::RawStreamMessage,
}

impl JetstreamClient {
    /// Create a Jetstream client using the default configuration
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self::new_with_prefix(client, Subject::from_static("$JS.API"))
    }

    /// Create a Jetstream client using the provided `domain`
    ///
    /// # Errors
    ///
    /// It returns an error if the subject derived by the `domain` is not valid.
    pub fn new_with_domain(
        client: Client,
        domain: impl Display,
    ) -> Result<Self, SubjectValidateError> {
        let prefix = format!("$JS.{domain}.API").try_into()?;
        Ok(Self::new_with_prefix(client, prefix))
    }

    /// Create a Jetstream client using the provided API `prefix`
    #[must_use]
    pub fn new_with_prefix(client: Client, prefix: Subject) -> Self {
        Self {
            client,
            prefix,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set how long to wait for every API response
    #[must_use]
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Create a new stream
    ///
    /// # Errors
    ///
    /// It returns an error if the stream name is not valid, if a different
    /// stream with the same name exists or if the request fails.
    pub async fn create_stream(&self, config: &StreamConfig) -> Result<Stream, JetstreamError> {
        let payload = serde_json::to_vec(config).map_err(JetstreamError::Json)?;
        self.api_request(format!("STREAM.CREATE.{}", config.name), payload.into())
            .await
    }

    /// Replace the configuration of an existing stream
    ///
    /// # Errors
    ///
    /// It returns an error if the stream doesn't exist, if the server refuses
    /// the new configuration or if the request fails.
    pub async fn update_stream(&self, config: &StreamConfig) -> Result<Stream, JetstreamError> {
        let payload = serde_json::to_vec(config).map_err(JetstreamError::Json)?;
        self.api_request(format!("STREAM.UPDATE.{}", config.name), payload.into())
            .await
    }

    /// List streams present within this client's Jetstream context
    pub fn streams(&self) -> Streams {
        Streams::new(self.clone())
    }

    /// Obtain a stream present within this client's Jetstream context
    ///
    /// # Errors
    ///
    /// It returns an error if the given `name` produces an invalid subject or if the request
    /// fails.
    pub async fn stream(&self, name: impl Display) -> Result<Option<Stream>, JetstreamError> {
        not_found_as_none(
            self.api_request(format!("STREAM.INFO.{name}"), Bytes::new())
                .await,
            JetstreamErrorCode::STREAM_NOT_FOUND,
        )
    }

    /// Delete a stream and every message it holds
    ///
    /// # Errors
    ///
    /// It returns an error if the stream doesn't exist or if the request fails.
    pub async fn delete_stream(&self, name: impl Display) -> Result<(), JetstreamError> {
        let response = self
            .api_request::<SuccessResponse>(format!("STREAM.DELETE.{name}"), Bytes::new())
            .await?;
        check_success(response.success)
    }

    /// Remove the messages of a stream, optionally only those matching `filter`
    ///
    /// Returns the number of messages that were removed.
    ///
    /// # Errors
    ///
    /// It returns an error if the stream doesn't exist or if the request fails.
    pub async fn purge_stream(
        &self,
        name: impl Display,
        filter: Option<&Subject>,
    ) -> Result<u64, JetstreamError> {
        let payload = match filter {
            Some(filter) => json_payload(&json!({ "filter": filter }))?,
            None => Bytes::new(),
        };
        let response = self
            .api_request::<PurgeResponse>(format!("STREAM.PURGE.{name}"), payload)
            .await?;
        check_success(response.success)?;
        Ok(response.purged)
    }

    /// Fetch the message stored in `stream` at `sequence`
    ///
    /// # Errors
    ///
    /// It returns an error if the stream doesn't exist or if the request fails.
    pub async fn get_message(
        &self,
        stream: impl Display,
        sequence: u64,
    ) -> Result<Option<StreamMessage>, JetstreamError> {
        self.stream_message(stream, &json!({ "seq": sequence }))
            .await
    }

    /// Fetch the most recent message stored in `stream` for `subject`
    ///
    /// # Errors
    ///
    /// It returns an error if the stream doesn't exist or if the request fails.
    pub async fn get_last_message(
        &self,
        stream: impl Display,
        subject: &Subject,
    ) -> Result<Option<StreamMessage>, JetstreamError> {
        self.stream_message(stream, &json!({ "last_by_subj": subject }))
            .await
    }

    async fn stream_message(
        &self,
        stream: impl Display,
        request: &serde_json::Value,
    ) -> Result<Option<StreamMessage>, JetstreamError> {
        let response = not_found_as_none(
            self.api_request::<MessageResponse>(
                format!("STREAM.MSG.GET.{stream}"),
                json_payload(request)?,
            )
            .await,
            JetstreamErrorCode::STREAM_MESSAGE_NOT_FOUND,
        )?;

        response
            .map(|response| response.message.decode())
            .transpose()
    }

    /// Fetch the most recent message for `subject` without going through the
    /// stream leader
    ///
    /// Only works on streams with `allow_direct` set.
    pub(crate) async fn direct_get_last(
        &self,
        stream: impl Display,
        subject: &Subject,
    ) -> Result<Option<StreamMessage>, JetstreamError> {
        let response = self
            .raw_request(
                format!("DIRECT.GET.{stream}"),
                json_payload(&json!({ "last_by_subj": subject }))?,
            )
            .await?;
        match response.status_code {
            Some(StatusCode::NOT_FOUND) => Ok(None),
            None | Some(StatusCode::OK) => StreamMessage::from_direct(response).map(Some),
            Some(_) => Err(JetstreamError::MalformedResponse),
        }
    }

    /// Delete the message stored in `stream` at `sequence`
    ///
    /// # Errors
    ///
    /// It returns an error if the message or the stream don't exist or if the
    /// request fails.
    pub async fn delete_message(
        &self,
        stream: impl Display,
        sequence: u64,
    ) -> Result<(), JetstreamError> {
        let response = self
            .api_request::<SuccessResponse>(
                format!("STREAM.MSG.DELETE.{stream}"),
                json_payload(&json!({ "seq": sequence, "no_erase": true }))?,
            )
            .await?;
        check_success(response.success)
    }

    /// Publish a message and wait for a stream to acknowledge storing it
    ///
    /// # Errors
    ///
    /// It returns an error if no stream listens on `subject`, if the stream
    /// refuses the message or if the request fails.
    pub async fn publish(
        &self,
        subject: Subject,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<PubAck, JetstreamError> {
        let response = self
            .client
            .request(subject)
            .headers(headers)
            .response_timeout(self.request_timeout)
            .payload(payload)
            .await
            .map_err(JetstreamError::Publish)?
            .await
            .map_err(JetstreamError::Response)?;
        decode_response(&response)
    }

    /// Create a consumer on `stream`
    ///
    /// Consumers without a name get one assigned by the server.
    ///
    /// # Errors
    ///
    /// It returns an error if the stream doesn't exist, if a different
    /// consumer with the same name exists or if the request fails.
    pub async fn create_consumer(
        &self,
        stream: impl Display,
        config: &ConsumerConfig,
    ) -> Result<Consumer, JetstreamError> {
        let stream = stream.to_string();
        let endpoint = if config.name.is_empty() {
            format!("CONSUMER.CREATE.{stream}")
        } else {
            format!("CONSUMER.CREATE.{stream}.{}", config.name)
        };
        let payload = json_payload(&json!({
            "stream_name": stream,
            "config": config,
        }))?;
        self.api_request(endpoint, payload).await
    }

    /// List consumers present within this client's Jetstream context
    pub fn consumers(&self, stream_name: impl Display) -> Consumers {
        Consumers::new(self.clone(), stream_name)
    }

    /// Obtain a consumer present within this client's Jetstream context
    ///
    /// # Errors
    ///
    /// It returns an error if the given `stream_name` and `consumer_name` produce an invalid
    /// subject or if the request fails.
    pub async fn consumer(
        &self,
        stream_name: impl Display,
        consumer_name: impl Display,
    ) -> Result<Option<Consumer>, JetstreamError> {
        not_found_as_none(
            self.api_request(
                format!("CONSUMER.INFO.{stream_name}.{consumer_name}"),
                Bytes::new(),
            )
            .await,
            JetstreamErrorCode::CONSUMER_NOT_FOUND,
        )
    }

    /// Delete a consumer
    ///
    /// # Errors
    ///
    /// It returns an error if the consumer doesn't exist or if the request fails.
    pub async fn delete_consumer(
        &self,
        stream_name: impl Display,
        consumer_name: impl Display,
    ) -> Result<(), JetstreamError> {
        let response = self
            .api_request::<SuccessResponse>(
                format!("CONSUMER.DELETE.{stream_name}.{consumer_name}"),
                Bytes::new(),
            )
            .await?;
        check_success(response.success)
    }

    /// Run a batch request over the provided `consumer`
    ///
    /// # Errors
    ///
    /// An error is returned if the subject is not valid or if the client has been closed.
    pub async fn consumer_batch(
        &self,
        consumer: &Consumer,
        expires: Duration,
        max_msgs: usize,
    ) -> Result<ConsumerBatch, JetstreamError> {
        ConsumerBatch::new(consumer, self.clone(), expires, max_msgs).await
    }

    /// Run a stream request over the provided `consumer`
    pub fn consumer_stream(
        &self,
        consumer: Consumer,
        expires: Duration,
        max_msgs: usize,
    ) -> ConsumerStream {
        ConsumerStream::new(consumer, self.clone(), expires, max_msgs)
    }

    pub(crate) async fn api_request<T>(
        &self,
        endpoint: String,
        payload: Bytes,
    ) -> Result<T, JetstreamError>
    where
        T: DeserializeOwned,
    {
        let response = self.raw_request(endpoint, payload).await?;
        decode_response(&response)
    }

    async fn raw_request(
        &self,
        endpoint: String,
        payload: Bytes,
    ) -> Result<ServerMessage, JetstreamError> {
        let subject = Subject::try_from(format!("{}.{endpoint}", self.prefix))
            .map_err(JetstreamError::Subject)?;
        debug!(%subject, "jetstream API request");

        self.client
            .request(subject)
            .response_timeout(self.request_timeout)
            .payload(payload)
            .await
            .map_err(JetstreamError::Publish)?
            .await
            .map_err(JetstreamError::Response)
    }

    /// Get a reference to the inner NATS Core client
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    #[must_use]
    pub fn prefix(&self) -> &Subject {
        &self.prefix
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

impl JetstreamApiError {
    /// The HTTP-like status of the error
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The Jetstream specific error code
    #[must_use]
    pub fn code(&self) -> JetstreamErrorCode {
        self.code
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl JetstreamErrorCode {
    pub const NOT_ENABLED: Self = Self(10076);
    pub const NOT_ENABLED_FOR_ACCOUNT: Self = Self(10039);
    pub const BAD_REQUEST: Self = Self(10003);

    pub const STREAM_NOT_FOUND: Self = Self(10059);
    pub const STREAM_NAME_IN_USE: Self = Self(10058);
    pub const STREAM_MESSAGE_NOT_FOUND: Self = Self(10037);
    pub const STREAM_WRONG_LAST_SEQUENCE: Self = Self(10071);

    pub const CONSUMER_NOT_FOUND: Self = Self(10014);
    pub const CONSUMER_NAME_IN_USE: Self = Self(10148);
}

impl Display for JetstreamErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<u16> for JetstreamErrorCode {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<JetstreamErrorCode> for u16 {
    fn from(value: JetstreamErrorCode) -> Self {
        value.0
    }
}

impl JetstreamError {
    /// The Jetstream error code, if the server refused the request
    #[must_use]
    pub fn api_code(&self) -> Option<JetstreamErrorCode> {
        match self {
            Self::Api(err) => Some(err.code),
            _ => None,
        }
    }
}

fn decode_response<T>(response: &ServerMessage) -> Result<T, JetstreamError>
where
    T: DeserializeOwned,
{
    match serde_json::from_slice::<Response<T>>(&response.base.payload)
        .map_err(JetstreamError::Json)?
    {
        Response::Error { error } => Err(JetstreamError::Api(error)),
        Response::Response(value) => Ok(value),
    }
}

fn not_found_as_none<T>(
    result: Result<T, JetstreamError>,
    not_found: JetstreamErrorCode,
) -> Result<Option<T>, JetstreamError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.api_code() == Some(not_found) => Ok(None),
        Err(err) => Err(err),
    }
}

fn check_success(success: bool) -> Result<(), JetstreamError> {
    if success {
        Ok(())
    } else {
        Err(JetstreamError::MalformedResponse)
    }
}

fn json_payload<T: Serialize>(value: &T) -> Result<Bytes, JetstreamError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(JetstreamError::Json)
}
