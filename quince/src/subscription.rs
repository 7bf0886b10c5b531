use std::{
    future::poll_fn,
    num::NonZeroU64,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures_core::{FusedStream, Stream};
use quince_proto::{error::ServerError, ServerMessage, SubscriptionId};
use tokio::time;

use crate::{
    core::{
        error::{ClientClosedError, DrainError},
        Client,
    },
    queue::{CloseReason, DeliveryQueue, Next, PendingLimits},
};

/// A NATS subscription
///
/// Receives messages coming from the NATS server with At Most Once Delivery.
///
/// Messages are yielded via the [`Stream`] implementation, or one at a time
/// via [`Subscription::next_message`], as they are received by client.
/// Errors can only occur immediately after subscribing or after the client reconnects.
///
/// Messages are buffered up to the subscription's [`PendingLimits`].
/// If the subscription is not polled for a relatively long period of time
/// the buffer will fill up and any further messages will be dropped.
///
/// Obtained from [`Client::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub(crate) id: SubscriptionId,
    client: Client,
    queue: Arc<DeliveryQueue>,
    status: SubscriptionStatus,
}

/// A NATS subscription handing every message to a callback
///
/// The subscription is closed when this handle is dropped.
///
/// Obtained from [`Client::subscribe_with_handler`].
#[derive(Debug)]
pub struct HandlerSubscription {
    id: SubscriptionId,
    client: Client,
    queue: Arc<DeliveryQueue>,
    status: SubscriptionStatus,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SubscriptionStatus {
    Subscribed,
    Unsubscribed,
}

/// An error encountered while waiting for the next message of a [`Subscription`]
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum NextMessageError {
    #[error("no message received within the timeout")]
    TimedOut,
    /// The client was closed
    #[error("connection closed")]
    ConnectionClosed,
    /// The subscription reached the limit set by [`Subscription::close_after`]
    #[error("maximum number of messages reached")]
    MaxMessagesReached,
    /// The subscription was closed or drained
    #[error("subscription is no longer valid")]
    BadSubscription,
    #[error("server error")]
    Server(#[source] ServerError),
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, client: Client, queue: Arc<DeliveryQueue>) -> Self {
        Self {
            id,
            client,
            queue,
            status: SubscriptionStatus::Subscribed,
        }
    }

    /// Wait up to `timeout` for the next message
    ///
    /// Messages already buffered are returned even after the subscription
    /// was closed or drained.
    ///
    /// # Errors
    ///
    /// It returns an error if no message arrives in time, if the
    /// subscription was closed or if the server reported an error.
    pub async fn next_message(
        &mut self,
        timeout: Duration,
    ) -> Result<ServerMessage, NextMessageError> {
        if self.status == SubscriptionStatus::Unsubscribed {
            return match self.queue.try_next() {
                Some(next) => next_to_result(next),
                None => Err(NextMessageError::BadSubscription),
            };
        }

        let queue = &self.queue;
        match time::timeout(timeout, poll_fn(|cx| queue.poll_next(cx))).await {
            Ok(next) => next_to_result(next),
            Err(_elapsed) => Err(NextMessageError::TimedOut),
        }
    }

    /// Returns the next buffered message without waiting
    pub(crate) fn try_next_message(&mut self) -> Option<ServerMessage> {
        match self.queue.try_next()? {
            Next::Item(Ok(message)) => Some(message),
            Next::Item(Err(_)) | Next::Closed(_) => None,
        }
    }

    /// Immediately close the subscription
    ///
    /// The `Stream` implementation will continue to yield any remaining
    /// in-flight or otherwise buffered messages.
    ///
    /// Calling this method multiple times is a NOOP.
    ///
    /// # Errors
    ///
    /// It returns an error if the client is closed.
    pub async fn close(&mut self) -> Result<(), ClientClosedError> {
        close(&self.client, self.id, &self.queue, &mut self.status).await
    }

    /// Close the subscription after `max_messages` have been delivered
    ///
    /// Ask the NATS Server to automatically close the subscription after
    /// `max_messages` have been sent to the client. Messages are also
    /// counted client side: once `max_messages` have been routed to this
    /// subscription it stops accepting new ones, even if the server keeps
    /// sending, and [`Subscription::next_message`] then fails with
    /// [`NextMessageError::MaxMessagesReached`].
    ///
    /// The limit is carried over when the client reconnects, minus the
    /// messages already received.
    ///
    /// # Errors
    ///
    /// It returns an error if the client is closed.
    pub async fn close_after(&mut self, max_messages: NonZeroU64) -> Result<(), ClientClosedError> {
        close_after(&self.client, self.id, &self.queue, &mut self.status, max_messages).await
    }

    /// Stop receiving new messages while keeping the ones already sent by the server
    ///
    /// Every message the server sent before it processed the unsubscription
    /// remains readable.
    ///
    /// # Errors
    ///
    /// It returns an error if the drain takes longer than `timeout` or if
    /// the client is closed. The subscription is closed in every case.
    pub async fn drain(&mut self, timeout: Duration) -> Result<(), DrainError> {
        drain(&self.client, self.id, &self.queue, &mut self.status, timeout, false).await
    }

    /// Buffered messages and bytes
    #[must_use]
    pub fn pending(&self) -> (usize, usize) {
        self.queue.pending()
    }

    /// Messages handed to the application so far
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.queue.delivered()
    }

    /// Messages dropped because the pending limits were exceeded
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    #[must_use]
    pub fn pending_limits(&self) -> PendingLimits {
        self.queue.limits()
    }

    /// Change how much this subscription may buffer
    ///
    /// Messages already buffered are kept even if they exceed the new limits.
    pub fn set_pending_limits(&self, limits: PendingLimits) {
        self.queue.set_limits(limits);
    }
}

impl Stream for Subscription {
    type Item = Result<ServerMessage, ServerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.queue.poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Next::Item(item)) => Poll::Ready(Some(item)),
            Poll::Ready(Next::Closed(_reason)) => {
                this.status = SubscriptionStatus::Unsubscribed;
                Poll::Ready(None)
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.queue.pending().0, None)
    }
}

impl FusedStream for Subscription {
    fn is_terminated(&self) -> bool {
        self.queue.is_closed() && self.queue.pending().0 == 0
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.detach();
        if self.status == SubscriptionStatus::Unsubscribed || self.queue.is_closed() {
            return;
        }

        self.client.lazy_unsubscribe(self.id, None);
    }
}

impl HandlerSubscription {
    pub(crate) fn new(id: SubscriptionId, client: Client, queue: Arc<DeliveryQueue>) -> Self {
        Self {
            id,
            client,
            queue,
            status: SubscriptionStatus::Subscribed,
        }
    }

    /// Immediately close the subscription
    ///
    /// Messages already buffered are still handed to the callback.
    /// Calling this method multiple times is a NOOP.
    ///
    /// # Errors
    ///
    /// It returns an error if the client is closed.
    pub async fn close(&mut self) -> Result<(), ClientClosedError> {
        close(&self.client, self.id, &self.queue, &mut self.status).await
    }

    /// Close the subscription after `max_messages` have been delivered
    ///
    /// See [`Subscription::close_after`].
    ///
    /// # Errors
    ///
    /// It returns an error if the client is closed.
    pub async fn close_after(&mut self, max_messages: NonZeroU64) -> Result<(), ClientClosedError> {
        close_after(&self.client, self.id, &self.queue, &mut self.status, max_messages).await
    }

    /// Stop receiving new messages and wait for the callback to process the buffered ones
    ///
    /// # Errors
    ///
    /// It returns an error if the drain takes longer than `timeout` or if
    /// the client is closed. The subscription is closed in every case.
    pub async fn drain(&mut self, timeout: Duration) -> Result<(), DrainError> {
        drain(&self.client, self.id, &self.queue, &mut self.status, timeout, true).await
    }

    /// Buffered messages and bytes
    #[must_use]
    pub fn pending(&self) -> (usize, usize) {
        self.queue.pending()
    }

    /// Messages handed to the callback so far
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.queue.delivered()
    }

    /// Messages dropped because the pending limits were exceeded
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    #[must_use]
    pub fn pending_limits(&self) -> PendingLimits {
        self.queue.limits()
    }

    /// Change how much this subscription may buffer
    pub fn set_pending_limits(&self, limits: PendingLimits) {
        self.queue.set_limits(limits);
    }
}

impl Drop for HandlerSubscription {
    fn drop(&mut self) {
        if self.status == SubscriptionStatus::Unsubscribed || self.queue.is_closed() {
            return;
        }

        self.queue.close(CloseReason::Unsubscribed);
        self.client.lazy_unsubscribe(self.id, None);
    }
}

async fn close(
    client: &Client,
    id: SubscriptionId,
    queue: &DeliveryQueue,
    status: &mut SubscriptionStatus,
) -> Result<(), ClientClosedError> {
    match (*status, queue.is_closed()) {
        (SubscriptionStatus::Subscribed, true) => {
            *status = SubscriptionStatus::Unsubscribed;
        }
        (SubscriptionStatus::Subscribed, false) => {
            client.unsubscribe(id, None).await?;
            *status = SubscriptionStatus::Unsubscribed;
        }
        (SubscriptionStatus::Unsubscribed, _) => {}
    }

    Ok(())
}

async fn close_after(
    client: &Client,
    id: SubscriptionId,
    queue: &DeliveryQueue,
    status: &mut SubscriptionStatus,
    max_messages: NonZeroU64,
) -> Result<(), ClientClosedError> {
    match (*status, queue.is_closed()) {
        (SubscriptionStatus::Subscribed, true) => {
            *status = SubscriptionStatus::Unsubscribed;
        }
        (SubscriptionStatus::Subscribed, false) => {
            client.unsubscribe(id, Some(max_messages)).await?;
        }
        (SubscriptionStatus::Unsubscribed, _) => {}
    }

    Ok(())
}

async fn drain(
    client: &Client,
    id: SubscriptionId,
    queue: &DeliveryQueue,
    status: &mut SubscriptionStatus,
    timeout: Duration,
    wait_processed: bool,
) -> Result<(), DrainError> {
    if *status == SubscriptionStatus::Unsubscribed {
        return Ok(());
    }
    *status = SubscriptionStatus::Unsubscribed;

    let result = time::timeout(timeout, async {
        client.drain_subscription(id).await?;
        if wait_processed {
            queue.wait_drained().await;
        }
        Ok::<_, ClientClosedError>(())
    })
    .await;

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            queue.close(CloseReason::ConnectionClosed);
            Err(DrainError::Closed(err))
        }
        Err(_elapsed) => {
            queue.close(CloseReason::Unsubscribed);
            Err(DrainError::TimedOut)
        }
    }
}

fn next_to_result(next: Next) -> Result<ServerMessage, NextMessageError> {
    match next {
        Next::Item(Ok(message)) => Ok(message),
        Next::Item(Err(err)) => Err(NextMessageError::Server(err)),
        Next::Closed(CloseReason::Unsubscribed) => Err(NextMessageError::BadSubscription),
        Next::Closed(CloseReason::MaxMessages) => Err(NextMessageError::MaxMessagesReached),
        Next::Closed(CloseReason::ConnectionClosed) => Err(NextMessageError::ConnectionClosed),
    }
}
