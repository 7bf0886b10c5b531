use std::{
    collections::VecDeque,
    pin::pin,
    sync::{Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use futures_util::task::AtomicWaker;
use quince_proto::{error::ServerError, ServerMessage};
use tokio::sync::Notify;

const DEFAULT_PENDING_MESSAGES: usize = 512 * 1024;
const DEFAULT_PENDING_BYTES: usize = 64 * 1024 * 1024;

/// How much a subscription may buffer before new messages are dropped
///
/// `None` disables the corresponding limit.
///
/// Default: 524288 messages and 64 MiB.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PendingLimits {
    pub messages: Option<usize>,
    pub bytes: Option<usize>,
}

impl PendingLimits {
    pub const UNLIMITED: Self = Self {
        messages: None,
        bytes: None,
    };

    #[must_use]
    pub fn new(messages: Option<usize>, bytes: Option<usize>) -> Self {
        Self { messages, bytes }
    }

    fn admits(self, messages: usize, bytes: usize) -> bool {
        self.messages.map_or(true, |max| messages < max)
            && self.bytes.map_or(true, |max| bytes <= max)
    }
}

impl Default for PendingLimits {
    fn default() -> Self {
        Self {
            messages: Some(DEFAULT_PENDING_MESSAGES),
            bytes: Some(DEFAULT_PENDING_BYTES),
        }
    }
}

/// Bounded queue between the connection handler and one subscription
///
/// The handler is the only producer, the subscription (or the delivery
/// worker running its callback) the only consumer. Pushing never blocks:
/// messages exceeding the pending limits are dropped and counted.
#[derive(Debug)]
pub(crate) struct DeliveryQueue {
    inner: Mutex<Inner>,
    waker: AtomicWaker,
    drained: Notify,
}

#[derive(Debug)]
struct Inner {
    items: VecDeque<Result<ServerMessage, ServerError>>,
    bytes: usize,
    limits: PendingLimits,
    delivered: u64,
    dropped: u64,
    slow: bool,
    in_progress: bool,
    detached: bool,
    closed: Option<CloseReason>,
}

/// Why a queue stopped accepting messages
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Unsubscribed,
    MaxMessages,
    ConnectionClosed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    Queued,
    /// The pending limits were hit, `first` is set for the first drop of
    /// a slow consumer episode
    Dropped {
        first: bool,
    },
    /// The consumer went away
    Detached,
    Closed,
}

#[derive(Debug)]
pub(crate) enum Next {
    Item(Result<ServerMessage, ServerError>),
    Closed(CloseReason),
}

impl DeliveryQueue {
    pub(crate) fn new(limits: PendingLimits) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                bytes: 0,
                limits,
                delivered: 0,
                dropped: 0,
                slow: false,
                in_progress: false,
                detached: false,
                closed: None,
            }),
            waker: AtomicWaker::new(),
            drained: Notify::new(),
        }
    }

    pub(crate) fn push(&self, message: ServerMessage) -> PushOutcome {
        let outcome = {
            let mut inner = self.lock();
            if inner.detached {
                return PushOutcome::Detached;
            }
            if inner.closed.is_some() {
                return PushOutcome::Closed;
            }

            let len = message.base.wire_payload_len();
            if inner
                .limits
                .admits(inner.items.len(), inner.bytes.saturating_add(len))
            {
                inner.items.push_back(Ok(message));
                inner.bytes += len;
                inner.slow = false;
                PushOutcome::Queued
            } else {
                inner.dropped += 1;
                let first = !inner.slow;
                inner.slow = true;
                return PushOutcome::Dropped { first };
            }
        };

        self.waker.wake();
        outcome
    }

    /// Queues an error regardless of the pending limits
    pub(crate) fn push_error(&self, error: ServerError) -> bool {
        {
            let mut inner = self.lock();
            if inner.detached || inner.closed.is_some() {
                return false;
            }
            inner.items.push_back(Err(error));
        }

        self.waker.wake();
        true
    }

    /// Stops accepting new messages
    ///
    /// Already queued messages remain readable. Closing twice keeps the
    /// first reason.
    pub(crate) fn close(&self, reason: CloseReason) {
        {
            let mut inner = self.lock();
            if inner.closed.is_some() {
                return;
            }
            inner.closed = Some(reason);
        }

        self.waker.wake();
        self.drained.notify_waiters();
    }

    /// Marks the consumer as gone and discards anything buffered
    pub(crate) fn detach(&self) {
        let mut inner = self.lock();
        inner.detached = true;
        inner.items.clear();
        inner.bytes = 0;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.lock().detached
    }

    pub(crate) fn poll_next(&self, cx: &mut Context<'_>) -> Poll<Next> {
        self.poll_pop(cx, false)
    }

    /// Like [`DeliveryQueue::poll_next`], but the queue only counts as
    /// drained once [`DeliveryQueue::finish_processing`] is called
    pub(crate) fn poll_next_tracked(&self, cx: &mut Context<'_>) -> Poll<Next> {
        self.poll_pop(cx, true)
    }

    pub(crate) fn try_next(&self) -> Option<Next> {
        let mut inner = self.lock();
        inner.pop(false)
    }

    pub(crate) fn finish_processing(&self) {
        let drained = {
            let mut inner = self.lock();
            inner.in_progress = false;
            inner.is_drained()
        };

        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Waits until the queue is closed, empty and nothing is being processed
    pub(crate) async fn wait_drained(&self) {
        loop {
            let mut notified = pin!(self.drained.notified());
            notified.as_mut().enable();
            if self.lock().is_drained() {
                return;
            }

            notified.await;
        }
    }

    /// Buffered messages and bytes
    pub(crate) fn pending(&self) -> (usize, usize) {
        let inner = self.lock();
        (inner.items.len(), inner.bytes)
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.lock().delivered
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub(crate) fn limits(&self) -> PendingLimits {
        self.lock().limits
    }

    pub(crate) fn set_limits(&self, limits: PendingLimits) {
        self.lock().limits = limits;
    }

    fn poll_pop(&self, cx: &mut Context<'_>, track: bool) -> Poll<Next> {
        let mut inner = self.lock();
        match inner.pop(track) {
            Some(next) => Poll::Ready(next),
            None => {
                // registered under the lock so a concurrent push can't be missed
                self.waker.register(cx.waker());
                Poll::Pending
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn pop(&mut self, track: bool) -> Option<Next> {
        match self.items.pop_front() {
            Some(item) => {
                if let Ok(message) = &item {
                    self.bytes -= message.base.wire_payload_len();
                    self.delivered += 1;
                }
                self.in_progress = track;
                Some(Next::Item(item))
            }
            None => self.closed.map(Next::Closed),
        }
    }

    fn is_drained(&self) -> bool {
        self.closed.is_some() && self.items.is_empty() && !self.in_progress
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, task::Context, time::Duration};

    use bytes::Bytes;
    use claims::{assert_matches, assert_none};
    use futures_util::task::noop_waker_ref;
    use quince_proto::{
        error::ServerError, headers::HeaderMap, MessageBase, ServerMessage, Subject,
        SubscriptionId,
    };

    use super::{CloseReason, DeliveryQueue, Next, PendingLimits, PushOutcome};

    fn message(payload: &'static [u8]) -> ServerMessage {
        ServerMessage {
            status_code: None,
            subscription_id: SubscriptionId::MIN,
            base: MessageBase {
                subject: Subject::from_static("orders"),
                reply_subject: None,
                headers: HeaderMap::new(),
                payload: Bytes::from_static(payload),
            },
        }
    }

    #[test]
    fn drops_over_message_limit() {
        let queue = DeliveryQueue::new(PendingLimits::new(Some(2), None));
        assert_eq!(PushOutcome::Queued, queue.push(message(b"1")));
        assert_eq!(PushOutcome::Queued, queue.push(message(b"2")));
        assert_eq!(
            PushOutcome::Dropped { first: true },
            queue.push(message(b"3"))
        );
        assert_eq!(
            PushOutcome::Dropped { first: false },
            queue.push(message(b"4"))
        );
        assert_eq!(2, queue.dropped());
        assert_eq!((2, 2), queue.pending());

        // making room ends the episode
        assert_matches!(queue.try_next(), Some(Next::Item(Ok(_))));
        assert_eq!(PushOutcome::Queued, queue.push(message(b"5")));
        assert_eq!(
            PushOutcome::Dropped { first: true },
            queue.push(message(b"6"))
        );
        assert_eq!(3, queue.dropped());
        assert_eq!(1, queue.delivered());
    }

    #[test]
    fn drops_over_byte_limit() {
        let queue = DeliveryQueue::new(PendingLimits::new(None, Some(8)));
        assert_eq!(PushOutcome::Queued, queue.push(message(b"12345")));
        assert_eq!(
            PushOutcome::Dropped { first: true },
            queue.push(message(b"6789"))
        );
        assert_eq!(PushOutcome::Queued, queue.push(message(b"678")));
        assert_eq!((2, 8), queue.pending());
    }

    #[test]
    fn closed_queue_stays_readable() {
        let queue = DeliveryQueue::new(PendingLimits::default());
        queue.push(message(b"a"));
        queue.push_error(ServerError::InvalidSubject);
        queue.close(CloseReason::MaxMessages);
        queue.close(CloseReason::ConnectionClosed);
        assert_eq!(PushOutcome::Closed, queue.push(message(b"b")));

        let mut cx = Context::from_waker(noop_waker_ref());
        assert_matches!(queue.poll_next(&mut cx), std::task::Poll::Ready(Next::Item(Ok(_))));
        assert_matches!(
            queue.poll_next(&mut cx),
            std::task::Poll::Ready(Next::Item(Err(ServerError::InvalidSubject)))
        );
        assert_matches!(
            queue.poll_next(&mut cx),
            std::task::Poll::Ready(Next::Closed(CloseReason::MaxMessages))
        );
    }

    #[test]
    fn detached_queue_refuses_messages() {
        let queue = DeliveryQueue::new(PendingLimits::default());
        queue.push(message(b"a"));
        queue.detach();
        assert_eq!(PushOutcome::Detached, queue.push(message(b"b")));
        assert_eq!((0, 0), queue.pending());
        assert_none!(queue.try_next());
    }

    #[tokio::test]
    async fn drained_after_processing() {
        let queue = Arc::new(DeliveryQueue::new(PendingLimits::default()));
        queue.push(message(b"a"));
        queue.close(CloseReason::Unsubscribed);

        let mut cx = Context::from_waker(noop_waker_ref());
        assert_matches!(
            queue.poll_next_tracked(&mut cx),
            std::task::Poll::Ready(Next::Item(Ok(_)))
        );

        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.wait_drained().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.finish_processing();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
