use std::{
    fmt::{self, Debug},
    future::IntoFuture,
};

use bytes::Bytes;
use futures_core::future::BoxFuture;
use quince_proto::{
    error::PayloadTooLargeError,
    headers::{HeaderMap, HeaderName, HeaderValue},
    MessageBase, Subject,
};

use crate::{
    client::{Client, ClientClosedError, SubscribeError},
    handler::HandlerCommand,
};

use super::Request;

/// A publishable message
#[derive(Debug, Clone)]
pub struct Publish {
    pub(super) subject: Subject,
    pub(super) reply_subject: Option<Subject>,
    pub(super) headers: HeaderMap,
    pub(super) payload: Bytes,
}

/// A constructor for a publishable message
///
/// Obtained from [`Publish::builder`].
#[derive(Debug)]
pub struct PublishBuilder {
    publish: Publish,
}

/// A constructor for a publishable message to be sent using the given client
///
/// Obtained from [`Client::publish`].
pub struct ClientPublish<'a> {
    client: &'a Client,
    publish: Publish,
}

/// A publisheable message ready to be published to the given client
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct DoClientPublish<'a> {
    client: &'a Client,
    publish: Publish,
}

/// A constructor for a publishable message to be sent using the given owned client
///
/// Obtained from [`Client::publish_owned`].
pub struct OwnedClientPublish {
    client: Client,
    publish: Publish,
}

/// A publisheable message ready to be published to the given owned client
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct DoOwnedClientPublish {
    client: Client,
    publish: Publish,
}

/// An error encountered while publishing a message
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PublishError {
    #[error("client closed")]
    Closed(#[source] ClientClosedError),
    /// The client is draining and no longer accepts publishes
    #[error("connection is draining")]
    Draining,
    /// Messages can't be published to wildcard subjects
    #[error("wildcard subjects can't be published to")]
    WildcardSubject,
    #[error("payload too large")]
    PayloadTooLarge(#[source] PayloadTooLargeError),
    /// The client is reconnecting and the reconnect buffer refused the message
    #[error("reconnect buffer exceeded")]
    ReconnectBufferExceeded,
    /// The client's command buffer is full
    ///
    /// Only returned by the `try_*` methods.
    #[error("client buffer full")]
    BufferFull,
}

/// The requested range doesn't fit in the payload
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[error("range of {count} bytes at offset {offset} is out of bounds for a payload of {len} bytes")]
pub struct PayloadRangeError {
    pub offset: usize,
    pub count: usize,
    pub len: usize,
}

macro_rules! publish {
    () => {
        #[must_use]
        pub fn reply_subject(mut self, reply_subject: Option<Subject>) -> Self {
            self.publish_mut().reply_subject = reply_subject;
            self
        }

        #[must_use]
        pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
            self.publish_mut().headers.insert(name, value);
            self
        }

        #[must_use]
        pub fn headers(mut self, headers: HeaderMap) -> Self {
            self.publish_mut().headers = headers;
            self
        }
    };
}

impl Publish {
    /// Build a new [`Publish`]
    #[must_use]
    pub fn builder(subject: Subject) -> PublishBuilder {
        PublishBuilder::subject(subject)
    }

    /// Publish this message to `client`
    pub fn client(self, client: &Client) -> DoClientPublish<'_> {
        DoClientPublish {
            client,
            publish: self,
        }
    }

    /// Publish this message to `client`, taking ownership of it
    pub fn client_owned(self, client: Client) -> DoOwnedClientPublish {
        DoOwnedClientPublish {
            client,
            publish: self,
        }
    }

    pub fn into_request(self) -> Request {
        Request {
            publish: self,
            response_timeout: None,
            cancellation: None,
        }
    }

    #[must_use]
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    fn into_message_base(self) -> MessageBase {
        let Self {
            subject,
            reply_subject,
            headers,
            payload,
        } = self;
        MessageBase {
            subject,
            reply_subject,
            headers,
            payload,
        }
    }
}

impl PublishBuilder {
    #[must_use]
    pub fn subject(subject: Subject) -> Self {
        Self {
            publish: Publish {
                subject,
                reply_subject: None,
                headers: HeaderMap::new(),
                payload: Bytes::new(),
            },
        }
    }

    publish!();

    #[must_use]
    pub fn payload(mut self, payload: Bytes) -> Publish {
        self.publish.payload = payload;
        self.publish
    }

    /// Use `count` bytes of `payload` starting at `offset` as the payload
    ///
    /// # Errors
    ///
    /// It returns an error if the range doesn't fit in `payload`.
    pub fn payload_slice(
        self,
        payload: &Bytes,
        offset: usize,
        count: usize,
    ) -> Result<Publish, PayloadRangeError> {
        slice_payload(payload, offset, count).map(|payload| self.payload(payload))
    }

    fn publish_mut(&mut self) -> &mut Publish {
        &mut self.publish
    }
}

impl<'a> ClientPublish<'a> {
    pub(crate) fn build(client: &'a Client, subject: Subject) -> Self {
        Self {
            client,
            publish: PublishBuilder::subject(subject).publish,
        }
    }

    publish!();

    pub fn payload(mut self, payload: Bytes) -> DoClientPublish<'a> {
        self.publish.payload = payload;
        self.publish.client(self.client)
    }

    /// Use `count` bytes of `payload` starting at `offset` as the payload
    ///
    /// # Errors
    ///
    /// It returns an error if the range doesn't fit in `payload`.
    pub fn payload_slice(
        self,
        payload: &Bytes,
        offset: usize,
        count: usize,
    ) -> Result<DoClientPublish<'a>, PayloadRangeError> {
        slice_payload(payload, offset, count).map(|payload| self.payload(payload))
    }

    /// Convert this into [`OwnedClientPublish`]
    #[must_use]
    pub fn to_owned(self) -> OwnedClientPublish {
        OwnedClientPublish {
            client: self.client.clone(),
            publish: self.publish,
        }
    }

    fn publish_mut(&mut self) -> &mut Publish {
        &mut self.publish
    }
}

impl OwnedClientPublish {
    pub(crate) fn build(client: Client, subject: Subject) -> Self {
        Self {
            client,
            publish: PublishBuilder::subject(subject).publish,
        }
    }

    publish!();

    pub fn payload(mut self, payload: Bytes) -> DoOwnedClientPublish {
        self.publish.payload = payload;
        self.publish.client_owned(self.client)
    }

    /// Use `count` bytes of `payload` starting at `offset` as the payload
    ///
    /// # Errors
    ///
    /// It returns an error if the range doesn't fit in `payload`.
    pub fn payload_slice(
        self,
        payload: &Bytes,
        offset: usize,
        count: usize,
    ) -> Result<DoOwnedClientPublish, PayloadRangeError> {
        slice_payload(payload, offset, count).map(|payload| self.payload(payload))
    }

    fn publish_mut(&mut self) -> &mut Publish {
        &mut self.publish
    }
}

impl DoClientPublish<'_> {
    /// Publish this message if there's enough immediately available space in the internal buffers
    ///
    /// This method will publish the given message only if there's enough
    /// immediately available space to enqueue it in the client's
    /// networking stack.
    ///
    /// # Errors
    ///
    /// It returns an error if the client's buffer is full, if the message
    /// is refused or if the client has been closed.
    pub fn try_publish(self) -> Result<(), PublishError> {
        try_publish(self.client, self.publish)
    }
}

impl<'a> IntoFuture for DoClientPublish<'a> {
    type Output = Result<(), PublishError>;
    type IntoFuture = BoxFuture<'a, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { publish(self.client, self.publish).await })
    }
}

impl DoOwnedClientPublish {
    /// Publish this message if there's enough immediately available space in the internal buffers
    ///
    /// This method will publish the given message only if there's enough
    /// immediately available space to enqueue it in the client's
    /// networking stack.
    ///
    /// # Errors
    ///
    /// It returns an error if the client's buffer is full, if the message
    /// is refused or if the client has been closed.
    pub fn try_publish(self) -> Result<(), PublishError> {
        try_publish(&self.client, self.publish)
    }
}

impl IntoFuture for DoOwnedClientPublish {
    type Output = Result<(), PublishError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { publish(&self.client, self.publish).await })
    }
}

impl From<SubscribeError> for PublishError {
    fn from(err: SubscribeError) -> Self {
        match err {
            SubscribeError::Draining => Self::Draining,
            SubscribeError::Closed(err) => Self::Closed(err),
        }
    }
}

fn slice_payload(payload: &Bytes, offset: usize, count: usize) -> Result<Bytes, PayloadRangeError> {
    match offset.checked_add(count) {
        Some(end) if end <= payload.len() => Ok(payload.slice(offset..end)),
        _ => Err(PayloadRangeError {
            offset,
            count,
            len: payload.len(),
        }),
    }
}

fn try_publish(client: &Client, publish: Publish) -> Result<(), PublishError> {
    let message = publish.into_message_base();
    let reserved = client.admit_publish(&message)?;
    client
        .try_enqueue_command(HandlerCommand::Publish { message, reserved })
        .inspect_err(|_| client.release_reserved(reserved))
}

async fn publish(client: &Client, publish: Publish) -> Result<(), PublishError> {
    let message = publish.into_message_base();
    let reserved = client.admit_publish(&message)?;
    client
        .enqueue_command(HandlerCommand::Publish { message, reserved })
        .await
        .map_err(|err| {
            client.release_reserved(reserved);
            PublishError::Closed(err)
        })
}

impl Debug for ClientPublish<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientPublish")
            .field("publish", &self.publish)
            .finish_non_exhaustive()
    }
}

impl Debug for DoClientPublish<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoClientPublish")
            .field("publish", &self.publish)
            .finish_non_exhaustive()
    }
}

impl Debug for OwnedClientPublish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedClientPublish")
            .field("publish", &self.publish)
            .finish_non_exhaustive()
    }
}

impl Debug for DoOwnedClientPublish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoOwnedClientPublish")
            .field("publish", &self.publish)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use claims::{assert_matches, assert_ok};
    use quince_proto::{
        error::PayloadTooLargeError,
        headers::{HeaderName, HeaderValue},
        Subject,
    };
    use tokio::sync::mpsc::error::TryRecvError;

    use crate::{
        client::{ClientBuilder, ReconnectBuffer},
        core::Client,
        handler::HandlerCommand,
    };

    use super::{PayloadRangeError, PublishError};

    #[tokio::test]
    async fn publish_enqueues_message() {
        let (client, mut handler) = Client::test(4);

        client
            .publish(Subject::from_static("orders.new"))
            .header(
                HeaderName::from_static("Trace"),
                HeaderValue::from_static("1"),
            )
            .payload(Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let HandlerCommand::Publish { message, reserved } = handler.receiver.try_recv().unwrap()
        else {
            unreachable!()
        };
        assert_eq!(0, reserved);
        assert_eq!("orders.new", message.subject.as_str());
        assert_eq!(Bytes::from_static(b"hello"), message.payload);
        assert_eq!(1, message.headers.len());
    }

    #[tokio::test]
    async fn payload_slice_range() {
        let (client, mut handler) = Client::test(4);
        let payload = Bytes::from_static(b"0123456789");

        client
            .publish(Subject::from_static("orders.new"))
            .payload_slice(&payload, 2, 5)
            .unwrap()
            .await
            .unwrap();
        let HandlerCommand::Publish { message, .. } = handler.receiver.try_recv().unwrap() else {
            unreachable!()
        };
        assert_eq!(Bytes::from_static(b"23456"), message.payload);

        assert_ok!(
            client
                .publish(Subject::from_static("orders.new"))
                .payload_slice(&payload, 10, 0)
                .unwrap()
                .await
        );
        let HandlerCommand::Publish { message, .. } = handler.receiver.try_recv().unwrap() else {
            unreachable!()
        };
        assert_eq!("orders.new", message.subject.as_str());
        assert!(message.payload.is_empty());
        assert_matches!(
            client
                .publish(Subject::from_static("orders.new"))
                .payload_slice(&payload, 8, 3),
            Err(PayloadRangeError {
                offset: 8,
                count: 3,
                len: 10
            })
        );
        assert_matches!(
            client
                .publish(Subject::from_static("orders.new"))
                .payload_slice(&payload, usize::MAX, 2),
            Err(PayloadRangeError { .. })
        );
    }

    #[tokio::test]
    async fn refuses_invalid_messages() {
        let (client, mut handler) = Client::test(4);

        assert_matches!(
            client
                .publish(Subject::from_static("orders.*"))
                .payload(Bytes::new())
                .await,
            Err(PublishError::WildcardSubject)
        );

        let oversized = Bytes::from(vec![0; 1024 * 1024 + 1]);
        assert_matches!(
            client
                .publish(Subject::from_static("orders.new"))
                .payload(oversized)
                .await,
            Err(PublishError::PayloadTooLarge(PayloadTooLargeError {
                max: 1_048_576,
                ..
            }))
        );
        assert_eq!(TryRecvError::Empty, handler.receiver.try_recv().unwrap_err());
    }

    #[tokio::test]
    async fn max_payload_check_can_be_disabled() {
        let (client, mut handler) = Client::test_with(ClientBuilder::new().check_max_payload(false), 4);

        let oversized = Bytes::from(vec![0; 1024 * 1024 + 1]);
        client
            .publish(Subject::from_static("orders.new"))
            .payload(oversized)
            .await
            .unwrap();
        assert_matches!(
            handler.receiver.try_recv(),
            Ok(HandlerCommand::Publish { .. })
        );
    }

    #[tokio::test]
    async fn try_publish_full_buffer() {
        let (client, _handler) = Client::test(1);

        client
            .publish(Subject::from_static("a"))
            .payload(Bytes::new())
            .try_publish()
            .unwrap();
        assert_matches!(
            client
                .publish(Subject::from_static("a"))
                .payload(Bytes::new())
                .try_publish(),
            Err(PublishError::BufferFull)
        );
    }

    #[tokio::test]
    async fn reconnect_buffer_policies() {
        let (client, mut handler) = Client::test_with(
            ClientBuilder::new().reconnect_buffer(ReconnectBuffer::Sized(8)),
            8,
        );
        handler.shared.state.set_reconnecting();

        client
            .publish(Subject::from_static("a"))
            .payload(Bytes::from_static(b"12345"))
            .await
            .unwrap();
        assert_matches!(
            client
                .publish(Subject::from_static("a"))
                .payload(Bytes::from_static(b"6789"))
                .await,
            Err(PublishError::ReconnectBufferExceeded)
        );

        let HandlerCommand::Publish { reserved, .. } = handler.receiver.try_recv().unwrap() else {
            unreachable!()
        };
        assert_eq!(5, reserved);
        client.release_reserved(reserved);

        client
            .publish(Subject::from_static("a"))
            .payload(Bytes::from_static(b"6789"))
            .await
            .unwrap();

        let (client, handler) = Client::test_with(
            ClientBuilder::new().reconnect_buffer(ReconnectBuffer::Disabled),
            8,
        );
        handler.shared.state.set_reconnecting();
        assert_matches!(
            client
                .publish(Subject::from_static("a"))
                .payload(Bytes::new())
                .await,
            Err(PublishError::ReconnectBufferExceeded)
        );
    }

    #[tokio::test]
    async fn closed_client_refuses_publish() {
        let (client, handler) = Client::test(4);
        assert!(handler.shared.state.set_closed());

        assert_matches!(
            client
                .publish(Subject::from_static("a"))
                .payload(Bytes::new())
                .await,
            Err(PublishError::Closed(_))
        );
    }
}
