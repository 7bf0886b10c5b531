use std::{
    collections::{btree_map::Entry, BTreeMap},
    num::NonZeroU64,
    sync::Arc,
};

use quince_proto::{QueueGroup, ServerMessage, Subject, SubscriptionId};
use tokio::sync::oneshot;

use crate::queue::{CloseReason, DeliveryQueue, PushOutcome};

/// Subscription id reserved for the shared request inbox
pub(crate) const MULTIPLEXED_SUBSCRIPTION_ID: SubscriptionId = SubscriptionId::MIN;

/// Maps subscription ids received in `MSG` to delivery queues
///
/// The server does the subject matching, so routing is a lookup by id.
/// Replies to multiplexed requests arrive on [`MULTIPLEXED_SUBSCRIPTION_ID`]
/// and are routed by subject to one-shot slots.
#[derive(Debug, Default)]
pub(crate) struct DispatchTable {
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    replies: Option<BTreeMap<Subject, oneshot::Sender<ServerMessage>>>,
}

#[derive(Debug)]
pub(crate) struct Subscription {
    pub(crate) subject: Subject,
    pub(crate) queue_group: Option<QueueGroup>,
    pub(crate) queue: Arc<DeliveryQueue>,
    pub(crate) callback: bool,
    max_messages: Option<NonZeroU64>,
    routed: u64,
    draining: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RouteOutcome {
    Queued,
    /// First message dropped since the subscription went over its pending limits
    SlowConsumer {
        subject: Subject,
    },
    /// Dropped while still over the pending limits
    Dropped,
    /// The consumer went away, the server should stop sending
    Detached,
    /// Nobody is waiting for this message
    Unknown,
}

impl DispatchTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &mut self,
        id: SubscriptionId,
        subject: Subject,
        queue_group: Option<QueueGroup>,
        queue: Arc<DeliveryQueue>,
        callback: bool,
    ) {
        self.subscriptions.insert(
            id,
            Subscription {
                subject,
                queue_group,
                queue,
                callback,
                max_messages: None,
                routed: 0,
                draining: false,
            },
        );
    }

    /// Removes the subscription, closing its queue
    pub(crate) fn deregister(&mut self, id: SubscriptionId, reason: CloseReason) -> bool {
        match self.subscriptions.remove(&id) {
            Some(subscription) => {
                subscription.queue.close(reason);
                true
            }
            None => false,
        }
    }

    pub(crate) fn get(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(&id)
    }

    pub(crate) fn contains(&self, id: SubscriptionId) -> bool {
        self.subscriptions.contains_key(&id)
    }

    pub(crate) fn route(&mut self, message: ServerMessage) -> RouteOutcome {
        let id = message.subscription_id;
        if id == MULTIPLEXED_SUBSCRIPTION_ID {
            return self.route_reply(message);
        }

        let Entry::Occupied(mut entry) = self.subscriptions.entry(id) else {
            return RouteOutcome::Unknown;
        };

        let subscription = entry.get_mut();
        subscription.routed += 1;
        let outcome = match subscription.queue.push(message) {
            PushOutcome::Queued => RouteOutcome::Queued,
            PushOutcome::Dropped { first: true } => RouteOutcome::SlowConsumer {
                subject: subscription.subject.clone(),
            },
            PushOutcome::Dropped { first: false } => RouteOutcome::Dropped,
            PushOutcome::Detached | PushOutcome::Closed => {
                entry.remove();
                return RouteOutcome::Detached;
            }
        };

        if subscription
            .max_messages
            .is_some_and(|max| subscription.routed >= max.get())
        {
            // the server already forgot about it
            entry.remove().queue.close(CloseReason::MaxMessages);
        }
        outcome
    }

    /// Limits the subscription to `max_messages` in total
    ///
    /// Returns the messages the server may still send, or `None` if the
    /// limit was already reached and the subscription got closed.
    pub(crate) fn close_after(
        &mut self,
        id: SubscriptionId,
        max_messages: NonZeroU64,
    ) -> Option<NonZeroU64> {
        let Entry::Occupied(mut entry) = self.subscriptions.entry(id) else {
            return None;
        };

        let subscription = entry.get_mut();
        subscription.max_messages = Some(max_messages);
        match subscription.remaining() {
            Some(remaining) => Some(remaining),
            None => {
                entry.remove().queue.close(CloseReason::MaxMessages);
                None
            }
        }
    }

    /// Marks the subscriptions as draining, returning the ones that weren't already
    pub(crate) fn begin_drain(&mut self, ids: &[SubscriptionId]) -> Vec<SubscriptionId> {
        ids.iter()
            .copied()
            .filter(|id| match self.subscriptions.get_mut(id) {
                Some(subscription) if !subscription.draining => {
                    subscription.draining = true;
                    true
                }
                Some(_) | None => false,
            })
            .collect()
    }

    /// Closes drained subscriptions, returning the queues of the callback ones
    pub(crate) fn finish_drain(&mut self, ids: &[SubscriptionId]) -> Vec<Arc<DeliveryQueue>> {
        ids.iter()
            .filter_map(|id| self.subscriptions.remove(id))
            .filter_map(|subscription| {
                subscription.queue.close(CloseReason::Unsubscribed);
                subscription.callback.then_some(subscription.queue)
            })
            .collect()
    }

    pub(crate) fn ids(&self) -> Vec<SubscriptionId> {
        self.subscriptions.keys().copied().collect()
    }

    /// Subscriptions to recreate after reconnecting
    pub(crate) fn resubscriptions(
        &self,
    ) -> impl Iterator<Item = (SubscriptionId, &Subscription, Option<NonZeroU64>)> {
        self.subscriptions
            .iter()
            .filter(|(_id, subscription)| !subscription.draining)
            .map(|(&id, subscription)| (id, subscription, subscription.remaining()))
    }

    /// Subscriptions whose consumer went away without unsubscribing
    pub(crate) fn remove_detached(&mut self) -> Vec<SubscriptionId> {
        let detached = self
            .subscriptions
            .iter()
            .filter(|(_id, subscription)| subscription.queue.is_detached())
            .map(|(&id, _subscription)| id)
            .collect::<Vec<_>>();
        for id in &detached {
            self.subscriptions.remove(id);
        }

        if let Some(replies) = &mut self.replies {
            replies.retain(|_subject, sender| !sender.is_closed());
        }
        detached
    }

    /// Registers a reply slot, returning `true` if the shared inbox must
    /// be subscribed first
    pub(crate) fn register_reply(
        &mut self,
        reply_subject: Subject,
        sender: oneshot::Sender<ServerMessage>,
    ) -> bool {
        let needs_subscribe = self.replies.is_none();
        self.replies
            .get_or_insert_with(BTreeMap::new)
            .insert(reply_subject, sender);
        needs_subscribe
    }

    pub(crate) fn remove_reply(&mut self, reply_subject: &Subject) {
        if let Some(replies) = &mut self.replies {
            replies.remove(reply_subject);
        }
    }

    pub(crate) fn has_reply_inbox(&self) -> bool {
        self.replies.is_some()
    }

    pub(crate) fn pending_replies(&self) -> usize {
        self.replies.as_ref().map_or(0, BTreeMap::len)
    }

    /// Closes every queue and drops every reply slot
    pub(crate) fn close_all(&mut self, reason: CloseReason) {
        for subscription in self.subscriptions.values() {
            subscription.queue.close(reason);
        }
        self.subscriptions.clear();
        self.replies = None;
    }

    fn route_reply(&mut self, message: ServerMessage) -> RouteOutcome {
        let Some(replies) = &mut self.replies else {
            return RouteOutcome::Unknown;
        };

        match replies.remove(&message.base.subject) {
            Some(sender) => match sender.send(message) {
                Ok(()) => RouteOutcome::Queued,
                Err(_message) => RouteOutcome::Unknown,
            },
            None => RouteOutcome::Unknown,
        }
    }
}

impl Subscription {
    fn remaining(&self) -> Option<NonZeroU64> {
        match self.max_messages {
            Some(max) => NonZeroU64::new(max.get().saturating_sub(self.routed)),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{num::NonZeroU64, sync::Arc};

    use bytes::Bytes;
    use claims::{assert_matches, assert_none, assert_ok, assert_some_eq};
    use quince_proto::{headers::HeaderMap, MessageBase, ServerMessage, Subject, SubscriptionId};
    use tokio::sync::oneshot;

    use super::{DispatchTable, RouteOutcome, MULTIPLEXED_SUBSCRIPTION_ID};
    use crate::queue::{CloseReason, DeliveryQueue, Next, PendingLimits};

    fn message(id: SubscriptionId, subject: &'static str) -> ServerMessage {
        ServerMessage {
            status_code: None,
            subscription_id: id,
            base: MessageBase {
                subject: Subject::from_static(subject),
                reply_subject: None,
                headers: HeaderMap::new(),
                payload: Bytes::from_static(b"data"),
            },
        }
    }

    fn register(table: &mut DispatchTable, id: u64, limits: PendingLimits) -> Arc<DeliveryQueue> {
        let queue = Arc::new(DeliveryQueue::new(limits));
        table.register(
            SubscriptionId::from(id),
            Subject::from_static("orders.>"),
            None,
            Arc::clone(&queue),
            false,
        );
        queue
    }

    #[test]
    fn routes_by_id() {
        let mut table = DispatchTable::new();
        let first = register(&mut table, 2, PendingLimits::default());
        let second = register(&mut table, 3, PendingLimits::default());

        let id = SubscriptionId::from(3);
        assert_eq!(RouteOutcome::Queued, table.route(message(id, "orders.1")));
        assert_eq!((0, 0), first.pending());
        assert_eq!(1, second.pending().0);
        assert_eq!(
            RouteOutcome::Unknown,
            table.route(message(SubscriptionId::from(9), "orders.1"))
        );
    }

    #[test]
    fn slow_consumer_and_detached() {
        let mut table = DispatchTable::new();
        let queue = register(&mut table, 2, PendingLimits::new(Some(1), None));
        let id = SubscriptionId::from(2);

        assert_eq!(RouteOutcome::Queued, table.route(message(id, "orders.1")));
        assert_eq!(
            RouteOutcome::SlowConsumer {
                subject: Subject::from_static("orders.>")
            },
            table.route(message(id, "orders.2"))
        );
        assert_eq!(RouteOutcome::Dropped, table.route(message(id, "orders.3")));

        queue.detach();
        assert_eq!(RouteOutcome::Detached, table.route(message(id, "orders.4")));
        assert!(!table.contains(id));
    }

    #[test]
    fn closes_after_max_messages() {
        let mut table = DispatchTable::new();
        let queue = register(&mut table, 2, PendingLimits::default());
        let id = SubscriptionId::from(2);

        table.route(message(id, "orders.1"));
        assert_some_eq!(
            table.close_after(id, NonZeroU64::new(3).unwrap()),
            NonZeroU64::new(2).unwrap()
        );
        table.route(message(id, "orders.2"));
        assert!(!queue.is_closed());
        table.route(message(id, "orders.3"));
        assert!(queue.is_closed());
        assert!(!table.contains(id));

        for _ in 0..3 {
            assert_matches!(queue.try_next(), Some(Next::Item(Ok(_))));
        }
        assert_matches!(queue.try_next(), Some(Next::Closed(CloseReason::MaxMessages)));
    }

    #[test]
    fn close_after_already_reached() {
        let mut table = DispatchTable::new();
        let queue = register(&mut table, 2, PendingLimits::default());
        let id = SubscriptionId::from(2);
        table.route(message(id, "orders.1"));
        table.route(message(id, "orders.2"));

        assert_none!(table.close_after(id, NonZeroU64::new(2).unwrap()));
        assert!(queue.is_closed());
    }

    #[test]
    fn drain_skips_resubscription() {
        let mut table = DispatchTable::new();
        register(&mut table, 2, PendingLimits::default());
        register(&mut table, 3, PendingLimits::default());

        let started = table.begin_drain(&[SubscriptionId::from(3), SubscriptionId::from(7)]);
        assert_eq!(vec![SubscriptionId::from(3)], started);
        assert!(table.begin_drain(&started).is_empty());

        let resubscribe = table
            .resubscriptions()
            .map(|(id, _, _)| id)
            .collect::<Vec<_>>();
        assert_eq!(vec![SubscriptionId::from(2)], resubscribe);

        // still routed until the barrier
        assert_eq!(
            RouteOutcome::Queued,
            table.route(message(SubscriptionId::from(3), "orders.1"))
        );
        assert!(table.finish_drain(&started).is_empty());
        assert!(!table.contains(SubscriptionId::from(3)));
    }

    #[test]
    fn replies_by_subject() {
        let mut table = DispatchTable::new();
        let (sender, mut receiver) = oneshot::channel();
        assert!(table.register_reply(Subject::from_static("_INBOX.abc.1"), sender));
        let (other_sender, _other_receiver) = oneshot::channel();
        assert!(!table.register_reply(Subject::from_static("_INBOX.abc.2"), other_sender));

        assert_eq!(
            RouteOutcome::Unknown,
            table.route(message(MULTIPLEXED_SUBSCRIPTION_ID, "_INBOX.abc.3"))
        );
        assert_eq!(
            RouteOutcome::Queued,
            table.route(message(MULTIPLEXED_SUBSCRIPTION_ID, "_INBOX.abc.1"))
        );
        assert_ok!(receiver.try_recv());
        assert_eq!(1, table.pending_replies());

        table.remove_reply(&Subject::from_static("_INBOX.abc.2"));
        assert_eq!(0, table.pending_replies());
        assert!(table.has_reply_inbox());
    }
}
