use alloc::boxed::Box;
use core::num::NonZeroU64;

use crate::{Connect, MessageBase, QueueGroup, Subject, SubscriptionId};

/// An operation sent from the client to the server
#[derive(Debug, Clone)]
pub enum ClientOp {
    Connect {
        connect: Box<Connect>,
    },
    /// Encoded as `HPUB` when the message carries headers, `PUB` otherwise
    Publish {
        message: MessageBase,
    },
    Subscribe {
        id: SubscriptionId,
        subject: Subject,
        queue_group: Option<QueueGroup>,
    },
    /// With `max_messages` the server unsubscribes after delivering that many messages
    Unsubscribe {
        id: SubscriptionId,
        max_messages: Option<NonZeroU64>,
    },
    Ping,
    Pong,
}
