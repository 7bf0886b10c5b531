use std::{num::NonZeroU64, process::abort, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use bytes::Bytes;
use quince_net::{
    error::{ConnectError, TlsConfigError},
    Connector,
};
use quince_proto::{
    error::PayloadTooLargeError, headers::HeaderMap, MessageBase, QueueGroup, ServerAddr,
    ServerInfo, ServerMessage, Subject, SubscriptionId,
};
use rand::RngCore;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError, Permit},
        oneshot,
    },
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use self::builder::{ClientBuilder, Echo, ReconnectBuffer};
pub use self::commands::{
    ClientPublish, ClientRequest, DoClientPublish, DoClientRequest, DoOwnedClientPublish,
    DoOwnedClientRequest, OwnedClientPublish, OwnedClientRequest, PayloadRangeError, Publish,
    PublishBuilder, PublishError, Request, RequestBuilder, ResponseError, ResponseFut,
};
pub use self::jetstream::{
    AckPolicy, Consumer, ConsumerBatch, ConsumerConfig, ConsumerDurability, ConsumerStream,
    ConsumerStreamError, Consumers, DeliverPolicy, DiscardPolicy, JetstreamApiError,
    JetstreamClient, JetstreamError, JetstreamErrorCode, PubAck, RetentionPolicy, StorageType, Stream, StreamConfig,
    StreamMessage, StreamState, Streams,
};
pub use self::kv::{Entry, KvConfig, KvError, Operation, Store};
pub use self::state::ConnectionState;
pub(crate) use self::state::RawClientState;
pub use self::statistics::Statistics;
pub(crate) use self::statistics::RawStatistics;
#[cfg(test)]
use self::tests::TestHandler;
use crate::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    core::{HandlerSubscription, MultiplexedSubscription, Subscription},
    delivery::DeliveryPool,
    dispatch::MULTIPLEXED_SUBSCRIPTION_ID,
    events::{EventDispatcher, EventListener, ListenerHandle},
    handler::{DrainTarget, Handler, HandlerCommand, RecycledHandler},
    queue::{DeliveryQueue, PendingLimits},
    server_pool::{KnownServer, ServerPool},
    supervisor::{self, Supervisor},
};

mod builder;
mod commands;
mod jetstream;
mod kv;
mod state;
mod statistics;
#[cfg(test)]
pub(crate) mod tests;

#[cfg(feature = "from-env")]
pub(super) mod from_env;

const CLIENT_OP_CHANNEL_SIZE: usize = 512;

/// A NATS client
///
/// `Client` is a `Clone`able handle to a NATS connection.
/// If the connection is lost, the client will automatically reconnect and
/// resume any currently open subscriptions.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    sender: mpsc::Sender<HandlerCommand>,
    shared: Arc<ClientShared>,
    multiplexed_subscription_prefix: Subject,
    next_subscription_id: AtomicU64,
    inbox_prefix: Subject,
    default_response_timeout: Duration,
    check_max_payload: bool,
    reconnect_buffer: ReconnectBuffer,
    pending_limits: PendingLimits,
    delivery: DeliveryPool,
}

/// State shared between the client handles and the connection actor
#[derive(Debug)]
pub(crate) struct ClientShared {
    pub(crate) info: ArcSwap<ServerInfo>,
    pub(crate) server: ArcSwap<ServerAddr>,
    pub(crate) servers: ArcSwap<Vec<KnownServer>>,
    pub(crate) state: RawClientState,
    pub(crate) stats: RawStatistics,
    pub(crate) events: EventDispatcher,
    /// Bytes of publishes enqueued while reconnecting
    pub(crate) reconnect_buffered: AtomicUsize,
    pub(crate) close_requested: CancellationToken,
    pub(crate) closed: CancellationToken,
}

/// An error encountered while trying to publish a command to a closed [`Client`]
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[error("client closed")]
pub struct ClientClosedError;

/// An error encountered while building a [`Client`]
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClientConnectError {
    /// Every configured server was tried once and none accepted the connection
    #[error("no server available")]
    NoServersAvailable {
        #[source]
        last_error: Option<ConnectError>,
    },
    #[error("invalid TLS configuration")]
    TlsConfig(#[source] TlsConfigError),
}

/// An error encountered while subscribing
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SubscribeError {
    /// The client is draining and doesn't accept new subscriptions
    #[error("connection is draining")]
    Draining,
    #[error("client closed")]
    Closed(#[source] ClientClosedError),
}

/// An error encountered while waiting for [`Client::flush`]
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FlushError {
    #[error("flush timed out")]
    TimedOut,
    #[error("client closed")]
    Closed(#[source] ClientClosedError),
}

/// An error encountered while draining a subscription or the whole client
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DrainError {
    /// The drain didn't complete in time, the subscription or client is
    /// closed anyway
    #[error("drain timed out")]
    TimedOut,
    #[error("client closed")]
    Closed(#[source] ClientClosedError),
}

impl Client {
    /// Construct a new client
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(super) async fn connect(builder: ClientBuilder) -> Result<Self, ClientConnectError> {
        let connector =
            Connector::new(builder.connect_options()).map_err(ClientConnectError::TlsConfig)?;
        let mut pool = ServerPool::new(builder.servers.clone(), !builder.no_randomize);
        let (conn, info, addr) = supervisor::connect_initial(&connector, &mut pool).await?;

        let events = EventDispatcher::spawn(builder.event_listeners.clone());
        let shared = Arc::new(ClientShared::new(&info, addr.clone(), events));
        let (sender, receiver) = mpsc::channel(CLIENT_OP_CHANNEL_SIZE);
        let multiplexed_subscription_prefix = create_inbox_subject(&builder.inbox_prefix);

        let recycle = RecycledHandler::new(
            Arc::clone(&shared),
            pool,
            builder.handler_config(),
            receiver,
            multiplexed_subscription_prefix.clone(),
        );
        let handler = Handler::new(conn, info, addr, recycle);
        shared.state.set_connected();
        tokio::spawn(Supervisor::new(connector, builder.reconnect_config()).run(handler));

        Ok(Self::from_parts(
            sender,
            shared,
            multiplexed_subscription_prefix,
            &builder,
        ))
    }

    fn from_parts(
        sender: mpsc::Sender<HandlerCommand>,
        shared: Arc<ClientShared>,
        multiplexed_subscription_prefix: Subject,
        builder: &ClientBuilder,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                sender,
                delivery: DeliveryPool::new(
                    builder.subscriber_delivery_task_count,
                    shared.events.clone(),
                ),
                shared,
                multiplexed_subscription_prefix,
                next_subscription_id: AtomicU64::new(u64::from(MULTIPLEXED_SUBSCRIPTION_ID) + 1),
                inbox_prefix: builder.inbox_prefix.clone(),
                default_response_timeout: builder.default_response_timeout,
                check_max_payload: builder.check_max_payload,
                reconnect_buffer: builder.reconnect_buffer,
                pending_limits: builder.pending_limits,
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn test(client_to_handler_chan_size: usize) -> (Self, TestHandler) {
        Self::test_with(Self::builder(), client_to_handler_chan_size)
    }

    #[cfg(test)]
    pub(crate) fn test_with(
        builder: ClientBuilder,
        client_to_handler_chan_size: usize,
    ) -> (Self, TestHandler) {
        let (sender, receiver) = mpsc::channel(client_to_handler_chan_size);
        let shared = Arc::new(ClientShared::test());
        shared.state.set_connected();
        let multiplexed_subscription_prefix = create_inbox_subject(&builder.inbox_prefix);

        let this = Self::from_parts(
            sender,
            Arc::clone(&shared),
            multiplexed_subscription_prefix,
            &builder,
        );
        (this, TestHandler { receiver, shared })
    }

    /// Publish a new message to the NATS server
    ///
    /// Consider calling [`Publish::client`] instead if you already have
    /// a [`Publish`] instance.
    #[must_use]
    pub fn publish(&self, subject: Subject) -> ClientPublish<'_> {
        ClientPublish::build(self, subject)
    }

    /// Publish a new message to the NATS server and wait for a response
    ///
    /// Consider calling [`Request::client`] instead if you already have
    /// a [`Request`] instance.
    #[must_use]
    pub fn request(&self, subject: Subject) -> ClientRequest<'_> {
        ClientRequest::build(self, subject)
    }

    /// Publish a new message to the NATS server, taking ownership of this client
    ///
    /// When possible consider using [`Client::publish`] instead.
    #[must_use]
    pub fn publish_owned(self, subject: Subject) -> OwnedClientPublish {
        OwnedClientPublish::build(self, subject)
    }

    /// Publish a new request to the NATS server, taking ownership of this client
    ///
    /// When possible consider using [`Client::request`] instead.
    #[must_use]
    pub fn request_owned(self, subject: Subject) -> OwnedClientRequest {
        OwnedClientRequest::build(self, subject)
    }

    /// Subscribe to the given filter subject
    ///
    /// Create a new subscription with the NATS server and ask for all
    /// messages matching the given `filter_subject` to be delivered
    /// to the client.
    ///
    /// If `queue_group` is provided and multiple clients subscribe with
    /// the same [`QueueGroup`] value, the NATS server will try to deliver
    /// these messages to only one of the clients.
    ///
    /// # Errors
    ///
    /// This returns an error if the client is draining or closed.
    pub async fn subscribe(
        &self,
        filter_subject: Subject,
        queue_group: Option<QueueGroup>,
    ) -> Result<Subscription, SubscribeError> {
        self.check_can_subscribe()?;
        let permit = self
            .inner
            .sender
            .reserve()
            .await
            .map_err(|_| SubscribeError::Closed(ClientClosedError))?;

        let (id, queue) = self.do_subscribe(permit, filter_subject, queue_group, false);
        Ok(Subscription::new(id, self.clone(), queue))
    }

    /// Subscribe to the given filter subject, handing every message to `callback`
    ///
    /// The callback runs on the client's delivery tasks, see
    /// [`ClientBuilder::subscriber_delivery_task_count`]. Messages of the
    /// same subscription are handed over one at a time, in order.
    /// A panicking callback is reported through
    /// [`EventListener::async_error`] and keeps receiving messages.
    ///
    /// # Errors
    ///
    /// This returns an error if the client is draining or closed.
    pub async fn subscribe_with_handler<F>(
        &self,
        filter_subject: Subject,
        queue_group: Option<QueueGroup>,
        callback: F,
    ) -> Result<HandlerSubscription, SubscribeError>
    where
        F: FnMut(ServerMessage) + Send + 'static,
    {
        self.check_can_subscribe()?;
        let permit = self
            .inner
            .sender
            .reserve()
            .await
            .map_err(|_| SubscribeError::Closed(ClientClosedError))?;

        let (id, queue) = self.do_subscribe(permit, filter_subject, queue_group, true);
        self.inner
            .delivery
            .dispatch(id, Arc::clone(&queue), Box::new(callback));
        Ok(HandlerSubscription::new(id, self.clone(), queue))
    }

    pub(crate) fn try_subscribe(
        &self,
        filter_subject: Subject,
        queue_group: Option<QueueGroup>,
    ) -> Result<Subscription, PublishError> {
        let permit = self
            .inner
            .sender
            .try_reserve()
            .map_err(PublishError::from_try_send_error)?;

        let (id, queue) = self.do_subscribe(permit, filter_subject, queue_group, false);
        Ok(Subscription::new(id, self.clone(), queue))
    }

    fn check_can_subscribe(&self) -> Result<(), SubscribeError> {
        match self.inner.shared.state.get() {
            ConnectionState::Closed => Err(SubscribeError::Closed(ClientClosedError)),
            state if state.is_shutting_down() => Err(SubscribeError::Draining),
            _ => Ok(()),
        }
    }

    fn do_subscribe(
        &self,
        permit: Permit<'_, HandlerCommand>,
        filter_subject: Subject,
        queue_group: Option<QueueGroup>,
        callback: bool,
    ) -> (SubscriptionId, Arc<DeliveryQueue>) {
        let id = self
            .inner
            .next_subscription_id
            .fetch_add(1, Ordering::AcqRel)
            .into();
        if id == SubscriptionId::MAX {
            abort();
        }
        let queue = Arc::new(DeliveryQueue::new(self.inner.pending_limits));

        permit.send(HandlerCommand::Subscribe {
            id,
            subject: filter_subject,
            queue_group,
            queue: Arc::clone(&queue),
            callback,
        });
        (id, queue)
    }

    /// Checks a message against the client's state and limits
    ///
    /// Returns the bytes reserved in the reconnect buffer.
    pub(crate) fn admit_publish(&self, message: &MessageBase) -> Result<usize, PublishError> {
        self.admit(&message.subject, message.wire_payload_len())
    }

    fn admit(&self, subject: &Subject, len: usize) -> Result<usize, PublishError> {
        let shared = &self.inner.shared;
        let state = shared.state.get();
        match state {
            ConnectionState::Closed => return Err(PublishError::Closed(ClientClosedError)),
            ConnectionState::DrainingConnection => return Err(PublishError::Draining),
            _ => {}
        }
        if subject.is_wildcard() {
            return Err(PublishError::WildcardSubject);
        }
        if self.inner.check_max_payload {
            let max = shared.info.load().max_payload.get() as usize;
            if len > max {
                return Err(PublishError::PayloadTooLarge(PayloadTooLargeError { len, max }));
            }
        }
        if state != ConnectionState::Reconnecting {
            return Ok(0);
        }

        match self.inner.reconnect_buffer {
            ReconnectBuffer::Disabled => Err(PublishError::ReconnectBufferExceeded),
            ReconnectBuffer::Unbounded => {
                shared.reconnect_buffered.fetch_add(len, Ordering::AcqRel);
                Ok(len)
            }
            ReconnectBuffer::Sized(max) => shared
                .reconnect_buffered
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |buffered| {
                    buffered.checked_add(len).filter(|&total| total <= max)
                })
                .map(|_| len)
                .map_err(|_| PublishError::ReconnectBufferExceeded),
        }
    }

    pub(crate) fn release_reserved(&self, reserved: usize) {
        if reserved > 0 {
            self.inner
                .shared
                .reconnect_buffered
                .fetch_sub(reserved, Ordering::AcqRel);
        }
    }

    pub(crate) async fn multiplexed_request(
        &self,
        subject: Subject,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<MultiplexedSubscription, PublishError> {
        let (reply_subject, reserved) = self.admit_request(&subject, &headers, &payload)?;
        let permit = match self.inner.sender.reserve().await {
            Ok(permit) => permit,
            Err(_) => {
                self.release_reserved(reserved);
                return Err(PublishError::Closed(ClientClosedError));
            }
        };

        Ok(self.do_multiplexed_request(permit, subject, reply_subject, headers, payload, reserved))
    }

    pub(crate) fn try_multiplexed_request(
        &self,
        subject: Subject,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<MultiplexedSubscription, PublishError> {
        let (reply_subject, reserved) = self.admit_request(&subject, &headers, &payload)?;
        let permit = match self.inner.sender.try_reserve() {
            Ok(permit) => permit,
            Err(err) => {
                self.release_reserved(reserved);
                return Err(PublishError::from_try_send_error(err));
            }
        };

        Ok(self.do_multiplexed_request(permit, subject, reply_subject, headers, payload, reserved))
    }

    fn admit_request(
        &self,
        subject: &Subject,
        headers: &HeaderMap,
        payload: &Bytes,
    ) -> Result<(Subject, usize), PublishError> {
        let reserved = self.admit(subject, headers.encoded_len() + payload.len())?;
        let reply_subject = create_inbox_subject(&self.inner.multiplexed_subscription_prefix);
        Ok((reply_subject, reserved))
    }

    fn do_multiplexed_request(
        &self,
        permit: Permit<'_, HandlerCommand>,
        subject: Subject,
        reply_subject: Subject,
        headers: HeaderMap,
        payload: Bytes,
        reserved: usize,
    ) -> MultiplexedSubscription {
        let (sender, receiver) = oneshot::channel();

        permit.send(HandlerCommand::RequestMultiplexed {
            subject,
            reply_subject: reply_subject.clone(),
            headers,
            payload,
            reply: sender,
            reserved,
        });
        MultiplexedSubscription::new(reply_subject, receiver, self.clone())
    }

    /// Wait until the server has processed everything sent so far
    ///
    /// Sends a `PING` and waits for the matching `PONG`. If the connection
    /// is lost in the meantime, the `PING` is sent again after reconnecting.
    ///
    /// # Errors
    ///
    /// It returns an error if the `PONG` doesn't arrive within `timeout` or
    /// if the client is closed.
    pub async fn flush(&self, timeout: Duration) -> Result<(), FlushError> {
        let (done, flushed) = oneshot::channel();
        let result = time::timeout(timeout, async {
            self.enqueue_command(HandlerCommand::Flush { done }).await?;
            flushed.await.map_err(|_| ClientClosedError)
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(FlushError::Closed(err)),
            Err(_elapsed) => Err(FlushError::TimedOut),
        }
    }

    /// Measure the round trip time to the server
    ///
    /// # Errors
    ///
    /// It returns an error if the client isn't currently connected.
    pub async fn rtt(&self) -> Result<Duration, ClientClosedError> {
        if !matches!(
            self.inner.shared.state.get(),
            ConnectionState::Connected | ConnectionState::DrainingSubscriptions
        ) {
            return Err(ClientClosedError);
        }

        let (reply, rtt) = oneshot::channel();
        self.enqueue_command(HandlerCommand::Rtt { reply }).await?;
        rtt.await.map_err(|_| ClientClosedError)
    }

    /// Gracefully shut the client down
    ///
    /// Every subscription is drained: the server is told to stop sending,
    /// the messages it already sent are delivered and callbacks are given
    /// the chance to process them. Pending publishes are then flushed and
    /// the connection is closed.
    ///
    /// New subscriptions fail with [`SubscribeError::Draining`] while this
    /// is in progress. Calling it again while draining waits for the first
    /// drain to complete.
    ///
    /// # Errors
    ///
    /// It returns an error if the client was already closed or if the drain
    /// takes longer than `timeout`. The client is closed in every case.
    pub async fn drain(&self, timeout: Duration) -> Result<(), DrainError> {
        let shared = &self.inner.shared;
        if let Err(state) = shared.state.begin_drain() {
            return match state {
                ConnectionState::Closed => Err(DrainError::Closed(ClientClosedError)),
                _ => time::timeout(timeout, shared.closed.cancelled())
                    .await
                    .map_err(|_| DrainError::TimedOut),
            };
        }
        debug!("draining client");

        let result = time::timeout(timeout, async {
            let (done, drained) = oneshot::channel();
            self.enqueue_command(HandlerCommand::Drain {
                target: DrainTarget::All,
                done,
            })
            .await?;
            let queues = drained.await.map_err(|_| ClientClosedError)?;
            for queue in queues {
                queue.wait_drained().await;
            }

            shared.state.set_draining_connection();
            let (done, flushed) = oneshot::channel();
            self.enqueue_command(HandlerCommand::Flush { done }).await?;
            flushed.await.map_err(|_| ClientClosedError)
        })
        .await;

        self.close().await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(DrainError::Closed(err)),
            Err(_elapsed) => Err(DrainError::TimedOut),
        }
    }

    /// Get the last [`ServerInfo`] sent by the server
    #[must_use]
    pub fn server_info(&self) -> Arc<ServerInfo> {
        self.inner.shared.info.load_full()
    }

    /// The server the client is, or was last, connected to
    #[must_use]
    pub fn connected_server(&self) -> ServerAddr {
        ServerAddr::clone(&self.inner.shared.server.load())
    }

    /// Every server the client may reconnect to
    #[must_use]
    pub fn servers(&self) -> Vec<KnownServer> {
        Vec::clone(&self.inner.shared.servers.load())
    }

    /// Servers learned from the cluster, as opposed to configured ones
    #[must_use]
    pub fn discovered_servers(&self) -> Vec<ServerAddr> {
        self.inner
            .shared
            .servers
            .load()
            .iter()
            .filter(|server| server.is_discovered())
            .map(|server| server.addr().clone())
            .collect()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state.get()
    }

    /// Returns `true` if the current server announced it's shutting down
    #[must_use]
    pub fn is_lame_duck(&self) -> bool {
        self.inner.shared.state.is_lameduck()
    }

    #[must_use]
    pub fn statistics(&self) -> Statistics {
        self.inner.shared.stats.snapshot()
    }

    /// Start delivering connection events to `listener`
    pub fn register_listener(&self, listener: Arc<dyn EventListener>) -> ListenerHandle {
        self.inner.shared.events.register(listener)
    }

    pub(crate) fn create_inbox_subject(&self) -> Subject {
        create_inbox_subject(&self.inner.inbox_prefix)
    }

    pub(crate) fn default_response_timeout(&self) -> Duration {
        self.inner.default_response_timeout
    }

    pub(crate) fn lazy_unsubscribe_multiplexed(&self, reply_subject: Subject) {
        if self
            .try_enqueue_command(HandlerCommand::UnsubscribeMultiplexed { reply_subject })
            .is_ok()
        {
            return;
        }

        self.inner.shared.state.store_is_failed_unsubscribe(true);
    }

    pub(crate) async fn unsubscribe(
        &self,
        id: SubscriptionId,
        max_messages: Option<NonZeroU64>,
    ) -> Result<(), ClientClosedError> {
        self.enqueue_command(HandlerCommand::Unsubscribe { id, max_messages })
            .await
    }

    pub(crate) fn lazy_unsubscribe(&self, id: SubscriptionId, max_messages: Option<NonZeroU64>) {
        if self
            .try_enqueue_command(HandlerCommand::Unsubscribe { id, max_messages })
            .is_ok()
        {
            return;
        }

        self.inner.shared.state.store_is_failed_unsubscribe(true);
    }

    /// Drains a single subscription, returning its queue once closed
    pub(crate) async fn drain_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<(), ClientClosedError> {
        let (done, drained) = oneshot::channel();
        self.enqueue_command(HandlerCommand::Drain {
            target: DrainTarget::One(id),
            done,
        })
        .await?;
        drained.await.map(drop).map_err(|_| ClientClosedError)
    }

    pub(super) async fn enqueue_command(
        &self,
        cmd: HandlerCommand,
    ) -> Result<(), ClientClosedError> {
        self.inner
            .sender
            .send(cmd)
            .await
            .map_err(|_| ClientClosedError)
    }

    pub(super) fn try_enqueue_command(&self, cmd: HandlerCommand) -> Result<(), PublishError> {
        self.inner
            .sender
            .try_send(cmd)
            .map_err(PublishError::from_try_send_error)
    }

    /// Close this client, waiting for any remaining buffered messages to be processed first
    ///
    /// Attempts to send commands to the NATS server after this method has been called will
    /// result into a [`ClientClosedError`] error. Calling it more than once is harmless.
    pub async fn close(&self) {
        let shared = &self.inner.shared;
        shared.close_requested.cancel();
        shared.closed.cancelled().await;
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shared.close_requested.cancel();
    }
}

impl ClientShared {
    pub(crate) fn new(info: &ServerInfo, server: ServerAddr, events: EventDispatcher) -> Self {
        Self {
            info: ArcSwap::from_pointee(info.clone()),
            server: ArcSwap::from_pointee(server),
            servers: ArcSwap::from_pointee(Vec::new()),
            state: RawClientState::new(),
            stats: RawStatistics::default(),
            events,
            reconnect_buffered: AtomicUsize::new(0),
            close_requested: CancellationToken::new(),
            closed: CancellationToken::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn test() -> Self {
        let info: ServerInfo = serde_json::from_str(
            r#"{"server_id":"1234","server_name":"quince-test","version":"2.10.17","proto":1,"headers":true,"max_payload":1048576,"jetstream":true}"#,
        )
        .unwrap();
        let server = "nats://127.0.0.1:4222".parse().unwrap();
        Self::new(&info, server, EventDispatcher::spawn(Vec::new()))
    }
}

impl PublishError {
    #[expect(
        clippy::needless_pass_by_value,
        reason = "this is an auxiliary conversion function"
    )]
    pub(crate) fn from_try_send_error<T>(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Full(_) => Self::BufferFull,
            TrySendError::Closed(_) => Self::Closed(ClientClosedError),
        }
    }
}

pub(crate) fn create_inbox_subject(prefix: &Subject) -> Subject {
    let mut suffix = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut suffix);

    let subject = format!("{}.{:x}", prefix, u128::from_ne_bytes(suffix));
    Subject::from_dangerous_value(subject.into())
}
