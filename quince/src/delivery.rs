use std::{
    fmt::{self, Debug},
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_core::Stream;
use futures_util::{stream::SelectAll, StreamExt};
use quince_proto::{ServerMessage, SubscriptionId};
use tokio::{sync::mpsc, task};
use tracing::{debug, warn};

use crate::{
    events::{AsyncError, Event, EventDispatcher},
    queue::{DeliveryQueue, Next},
};

pub(crate) type Callback = Box<dyn FnMut(ServerMessage) + Send>;

/// Runs the callbacks of handler subscriptions
#[derive(Debug)]
pub(crate) struct DeliveryPool {
    workers: Workers,
    events: EventDispatcher,
}

#[derive(Debug)]
enum Workers {
    /// Every subscription gets its own task
    PerSubscription,
    /// Subscriptions are spread over a fixed set of tasks by id
    Shared(Vec<mpsc::UnboundedSender<CallbackStream>>),
}

/// Hands the messages of one queue to its callback, one at a time
struct CallbackStream {
    id: SubscriptionId,
    queue: Arc<DeliveryQueue>,
    callback: Callback,
    events: EventDispatcher,
}

impl DeliveryPool {
    /// Must be called from within a tokio runtime when `workers > 0`
    pub(crate) fn new(workers: usize, events: EventDispatcher) -> Self {
        let workers = if workers == 0 {
            Workers::PerSubscription
        } else {
            Workers::Shared(
                (0..workers)
                    .map(|_| {
                        let (sender, receiver) = mpsc::unbounded_channel();
                        tokio::spawn(run_worker(receiver));
                        sender
                    })
                    .collect(),
            )
        };

        Self { workers, events }
    }

    pub(crate) fn dispatch(&self, id: SubscriptionId, queue: Arc<DeliveryQueue>, callback: Callback) {
        let stream = CallbackStream {
            id,
            queue,
            callback,
            events: self.events.clone(),
        };

        match &self.workers {
            Workers::PerSubscription => {
                tokio::spawn(run_single(stream));
            }
            Workers::Shared(workers) => {
                #[expect(
                    clippy::cast_possible_truncation,
                    reason = "the remainder is smaller than the number of workers"
                )]
                let index = (u64::from(id) % workers.len() as u64) as usize;
                if workers[index].send(stream).is_err() {
                    debug!(subscription_id = %id, "delivery worker is gone");
                }
            }
        }
    }
}

async fn run_single(mut stream: CallbackStream) {
    while stream.next().await.is_some() {
        task::consume_budget().await;
    }
}

async fn run_worker(mut jobs: mpsc::UnboundedReceiver<CallbackStream>) {
    let mut streams = SelectAll::new();

    loop {
        tokio::select! {
            job = jobs.recv() => match job {
                Some(stream) => streams.push(stream),
                None => break,
            },
            Some(()) = streams.next(), if !streams.is_empty() => {
                task::consume_budget().await;
            }
        }
    }

    while streams.next().await.is_some() {
        task::consume_budget().await;
    }
}

impl CallbackStream {
    fn invoke(&mut self, message: ServerMessage) {
        let callback = &mut self.callback;
        if panic::catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
            warn!(subscription_id = %self.id, "subscription callback panicked");
            self.events
                .emit(Event::AsyncError(AsyncError::CallbackPanicked {
                    subscription_id: self.id,
                }));
        }
    }
}

impl Stream for CallbackStream {
    type Item = ();

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.queue.poll_next_tracked(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Next::Item(Ok(message))) => {
                this.invoke(message);
                this.queue.finish_processing();
                Poll::Ready(Some(()))
            }
            Poll::Ready(Next::Item(Err(err))) => {
                this.events.emit(Event::AsyncError(AsyncError::Server(err)));
                this.queue.finish_processing();
                Poll::Ready(Some(()))
            }
            Poll::Ready(Next::Closed(_reason)) => Poll::Ready(None),
        }
    }
}

impl Debug for CallbackStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackStream")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
