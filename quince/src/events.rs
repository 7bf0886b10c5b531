use std::{
    fmt::{self, Debug},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Weak},
};

use arc_swap::ArcSwap;
use quince_proto::{error::ServerError, ServerAddr, Subject, SubscriptionId};
use tokio::sync::mpsc;
use tracing::warn;

use crate::atomic::{AtomicU64, Ordering};

/// Receives connection lifecycle notifications
///
/// Every method has an empty default implementation. Methods are invoked
/// from a dedicated task, one event at a time and in the order they
/// happened. A panicking listener is logged and doesn't affect the others.
pub trait EventListener: Send + Sync + 'static {
    /// The connection to `server` was lost
    fn disconnected(&self, server: &ServerAddr) {
        let _ = server;
    }

    /// A new connection to `server` was established after a disconnect
    fn reconnected(&self, server: &ServerAddr) {
        let _ = server;
    }

    /// The client was closed and won't reconnect anymore
    fn closed(&self) {}

    /// The cluster advertised servers which weren't known before
    fn server_discovered(&self, servers: &[ServerAddr]) {
        let _ = servers;
    }

    /// An error which isn't tied to any pending operation
    fn async_error(&self, error: &AsyncError) {
        let _ = error;
    }

    /// `server` entered lame duck mode and is going to shut down soon
    fn lame_duck_mode(&self, server: &ServerAddr) {
        let _ = server;
    }
}

/// An error reported to [`EventListener::async_error`]
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum AsyncError {
    /// The subscription buffer was full and messages started being dropped
    ///
    /// Reported once, until the subscription catches up again.
    #[error("slow consumer on subscription {subscription_id:?} ({subject})")]
    SlowConsumer {
        subscription_id: SubscriptionId,
        subject: Subject,
    },
    /// The server rejected an operation without closing the connection
    #[error("server error")]
    Server(#[source] ServerError),
    /// A subscription callback panicked while handling a message
    #[error("callback of subscription {subscription_id:?} panicked")]
    CallbackPanicked { subscription_id: SubscriptionId },
}

#[derive(Debug)]
pub(crate) enum Event {
    Disconnected(ServerAddr),
    Reconnected(ServerAddr),
    Closed,
    ServerDiscovered(Vec<ServerAddr>),
    AsyncError(AsyncError),
    LameDuckMode(ServerAddr),
}

/// Fans events out to the registered listeners
#[derive(Debug, Clone)]
pub(crate) struct EventDispatcher {
    sender: mpsc::UnboundedSender<Event>,
    listeners: Arc<Listeners>,
}

struct Listeners {
    next_id: AtomicU64,
    list: ArcSwap<Vec<(u64, Arc<dyn EventListener>)>>,
}

/// Keeps a listener registered through [`Client::register_listener`]
///
/// Dropping the handle unregisters the listener.
///
/// [`Client::register_listener`]: crate::core::Client::register_listener
#[derive(Debug)]
#[must_use = "the listener is unregistered when the handle is dropped"]
pub struct ListenerHandle {
    id: u64,
    listeners: Weak<Listeners>,
}

impl EventDispatcher {
    /// Starts the dispatching task
    ///
    /// Must be called from within a tokio runtime. The task stops once
    /// every clone of the dispatcher has been dropped.
    pub(crate) fn spawn(initial: Vec<Arc<dyn EventListener>>) -> Self {
        let listeners = Arc::new(Listeners {
            next_id: AtomicU64::new(0),
            list: ArcSwap::from_pointee(Vec::new()),
        });
        for listener in initial {
            listeners.add(listener);
        }

        let (sender, mut receiver) = mpsc::unbounded_channel();
        tokio::spawn({
            let listeners = Arc::clone(&listeners);
            async move {
                while let Some(event) = receiver.recv().await {
                    listeners.deliver(&event);
                }
            }
        });

        Self { sender, listeners }
    }

    pub(crate) fn emit(&self, event: Event) {
        // the task only goes away with the runtime
        let _ = self.sender.send(event);
    }

    pub(crate) fn register(&self, listener: Arc<dyn EventListener>) -> ListenerHandle {
        let id = self.listeners.add(listener);
        ListenerHandle {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }
}

impl Listeners {
    fn add(&self, listener: Arc<dyn EventListener>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.list.rcu(|list| {
            let mut list = Vec::clone(list);
            list.push((id, Arc::clone(&listener)));
            list
        });
        id
    }

    fn remove(&self, id: u64) {
        self.list.rcu(|list| {
            list.iter()
                .filter(|(listener_id, _)| *listener_id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    fn deliver(&self, event: &Event) {
        for (id, listener) in self.list.load().iter() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| match event {
                Event::Disconnected(server) => listener.disconnected(server),
                Event::Reconnected(server) => listener.reconnected(server),
                Event::Closed => listener.closed(),
                Event::ServerDiscovered(servers) => listener.server_discovered(servers),
                Event::AsyncError(error) => listener.async_error(error),
                Event::LameDuckMode(server) => listener.lame_duck_mode(server),
            }));
            if result.is_err() {
                warn!(listener_id = id, ?event, "event listener panicked");
            }
        }
    }
}

impl Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("len", &self.list.load().len())
            .finish_non_exhaustive()
    }
}

impl ListenerHandle {
    /// Stop delivering events to the listener
    pub fn unregister(self) {
        drop(self);
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(self.id);
        }
    }
}
