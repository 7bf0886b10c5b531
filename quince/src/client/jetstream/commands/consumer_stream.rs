use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_core::{future::BoxFuture, FusedStream, Stream};
use pin_project_lite::pin_project;
use quince_proto::{error::ServerError, ServerMessage};

use crate::client::{Consumer, JetstreamClient, JetstreamError};

use super::ConsumerBatch;

pin_project! {
    /// An endless sequence of pull requests over a consumer
    ///
    /// A new batch is requested as soon as the previous one ends.
    ///
    /// Obtained from [`JetstreamClient::consumer_stream`].
    #[must_use = "streams do nothing unless polled"]
    pub struct ConsumerStream {
        #[pin]
        status: ConsumerStreamStatus,
        consumer: Consumer,
        client: JetstreamClient,

        expires: Duration,
        max_msgs: usize,
    }
}

pin_project! {
    #[project = ConsumerStreamStatusProj]
    enum ConsumerStreamStatus {
        Polling {
            future: BoxFuture<'static, Result<ConsumerBatch, JetstreamError>>,
        },
        RunningBatch {
            #[pin]
            batch: ConsumerBatch,
        },
        Broken,
    }
}

/// An error encountered while pulling messages from a consumer
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConsumerStreamError {
    #[error("an error returned by the server")]
    Server(#[source] ServerError),
    #[error("unexpected status code")]
    UnexpectedStatus(Box<ServerMessage>),
    #[error("jetstream error")]
    Jetstream(#[source] JetstreamError),
}

impl ConsumerStream {
    pub(crate) fn new(
        consumer: Consumer,
        client: JetstreamClient,
        expires: Duration,
        max_msgs: usize,
    ) -> Self {
        let future = Box::pin(ConsumerBatch::new(
            &consumer,
            client.clone(),
            expires,
            max_msgs,
        ));

        Self {
            status: ConsumerStreamStatus::Polling { future },
            consumer,
            client,

            expires,
            max_msgs,
        }
    }
}

impl Stream for ConsumerStream {
    type Item = Result<ServerMessage, ConsumerStreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            match this.status.as_mut().project() {
                ConsumerStreamStatusProj::RunningBatch { batch } => match batch.poll_next(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Some(Ok(msg))) => return Poll::Ready(Some(Ok(msg))),
                    Poll::Ready(Some(Err(err))) => {
                        this.status.set(ConsumerStreamStatus::Broken);
                        return Poll::Ready(Some(Err(err)));
                    }
                    Poll::Ready(None) => {
                        this.status.set(ConsumerStreamStatus::Polling {
                            future: Box::pin(ConsumerBatch::new(
                                this.consumer,
                                this.client.clone(),
                                *this.expires,
                                *this.max_msgs,
                            )),
                        });
                    }
                },
                ConsumerStreamStatusProj::Polling { future } => match Pin::new(future).poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(batch)) => {
                        this.status.set(ConsumerStreamStatus::RunningBatch { batch });
                    }
                    Poll::Ready(Err(err)) => {
                        this.status.set(ConsumerStreamStatus::Broken);
                        return Poll::Ready(Some(Err(ConsumerStreamError::Jetstream(err))));
                    }
                },
                ConsumerStreamStatusProj::Broken => return Poll::Ready(None),
            }
        }
    }
}

impl FusedStream for ConsumerStream {
    fn is_terminated(&self) -> bool {
        matches!(self.status, ConsumerStreamStatus::Broken)
    }
}

impl std::fmt::Debug for ConsumerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerStream")
            .field("consumer", &self.consumer.name)
            .field("expires", &self.expires)
            .field("max_msgs", &self.max_msgs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::Utc;
    use futures_util::StreamExt;
    use quince_proto::{headers::HeaderMap, MessageBase, ServerMessage, Subject};

    use crate::{
        client::{tests::TestHandler, Consumer, ConsumerConfig, JetstreamClient},
        core::Client,
        handler::HandlerCommand,
    };

    /// Answers the next pull request with a single message
    async fn serve(handler: &mut TestHandler, payload: &'static [u8]) {
        let (id, queue) = loop {
            match handler.receiver.recv().await {
                Some(HandlerCommand::Subscribe { id, queue, .. }) => break (id, queue),
                Some(HandlerCommand::Unsubscribe { .. }) => {}
                _ => unreachable!(),
            }
        };
        let Some(HandlerCommand::Publish { .. }) = handler.receiver.recv().await else {
            unreachable!()
        };

        queue.push(ServerMessage {
            status_code: None,
            subscription_id: id,
            base: MessageBase {
                subject: Subject::from_static("orders.eu"),
                reply_subject: None,
                headers: HeaderMap::new(),
                payload: Bytes::from_static(payload),
            },
        });
    }

    #[tokio::test]
    async fn requests_a_new_batch_when_one_ends() {
        let (client, mut handler) = Client::test(8);
        let jetstream = JetstreamClient::new(client).with_request_timeout(Duration::from_secs(5));
        let consumer = Consumer {
            stream_name: "ORDERS".to_owned(),
            name: "worker".to_owned(),
            config: ConsumerConfig::default(),
            created_at: Utc::now(),
            num_pending: 0,
        };
        let mut stream = Box::pin(jetstream.consumer_stream(consumer, Duration::ZERO, 1));

        let (first, ()) = tokio::join!(stream.next(), serve(&mut handler, b"one"));
        assert_eq!(Bytes::from_static(b"one"), first.unwrap().unwrap().base.payload);

        let (second, ()) = tokio::join!(stream.next(), serve(&mut handler, b"two"));
        assert_eq!(Bytes::from_static(b"two"), second.unwrap().unwrap().base.payload);
    }
}
