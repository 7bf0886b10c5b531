pub use quince_proto as proto;

mod atomic;
mod client;
mod delivery;
mod dispatch;
mod events;
mod handler;
mod multiplexed_subscription;
mod queue;
mod server_pool;
mod subscription;
mod supervisor;
#[cfg(test)]
pub(crate) mod tests;

pub mod core {
    //! NATS Core functionality implementation

    pub use crate::client::{
        Client, ClientBuilder, ConnectionState, Echo, ReconnectBuffer, Statistics,
    };
    pub use crate::events::{AsyncError, EventListener, ListenerHandle};
    pub(crate) use crate::multiplexed_subscription::MultiplexedSubscription;
    pub use crate::queue::PendingLimits;
    pub use crate::server_pool::{KnownServer, MaxReconnect};
    pub use crate::subscription::{HandlerSubscription, Subscription};
    pub use quince_net::AuthenticationMethod;

    pub mod publish {
        //! Utilities for publishing messages

        pub use crate::client::{
            ClientPublish, DoClientPublish, DoOwnedClientPublish, OwnedClientPublish, Publish,
            PublishBuilder,
        };
    }

    pub mod request {
        //! Utilities for publishing messages and awaiting for a response

        pub use crate::client::{
            ClientRequest, DoClientRequest, DoOwnedClientRequest, OwnedClientRequest, Request,
            RequestBuilder, ResponseFut,
        };
    }

    pub mod error {
        //! NATS Core specific errors

        #[cfg(feature = "from-env")]
        pub use crate::client::from_env::FromEnvError;
        pub use crate::client::{
            ClientClosedError, ClientConnectError, DrainError, FlushError, PayloadRangeError,
            PublishError, ResponseError, SubscribeError,
        };
        pub use crate::subscription::NextMessageError;
        pub use quince_net::error::ConnectError;
        pub use quince_proto::error::ServerError;
    }
}

pub mod jetstream {
    //! NATS Jetstream functionality implementation
    //!
    //! Relies on NATS Core to communicate with the NATS server

    pub use crate::client::{
        AckPolicy, Consumer, ConsumerBatch, ConsumerConfig, ConsumerDurability, ConsumerStream,
        ConsumerStreamError, Consumers, DeliverPolicy, DiscardPolicy, JetstreamClient, PubAck,
        RetentionPolicy, StorageType, Stream, StreamConfig, StreamMessage, StreamState, Streams,
    };

    pub mod error {
        //! NATS Jetstream specific errors

        pub use crate::client::{JetstreamApiError, JetstreamError, JetstreamErrorCode};
    }
}

pub mod kv {
    //! Key-Value buckets built on top of Jetstream streams

    pub use crate::client::{Entry, KvConfig, KvError, Operation, Store};
}
