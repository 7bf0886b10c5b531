use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_core::{FusedStream, Future, Stream};
use pin_project_lite::pin_project;
use quince_proto::{ServerMessage, StatusCode, Subject};
use serde_json::json;
use tokio::time::{sleep, Sleep};

use crate::{
    client::{Consumer, JetstreamClient, JetstreamError, PublishError},
    subscription::Subscription,
};

use super::ConsumerStreamError;

pin_project! {
    /// A single pull request over a consumer
    ///
    /// Yields at most the requested number of messages, then ends. It also
    /// ends early once the server reports there's nothing left to deliver
    /// or the request expires.
    ///
    /// Obtained from [`JetstreamClient::consumer_batch`].
    #[derive(Debug)]
    #[must_use = "streams do nothing unless polled"]
    pub struct ConsumerBatch {
        subscription: Subscription,
        #[pin]
        timeout: Sleep,
        pending_msgs: usize,
    }
}

impl ConsumerBatch {
    pub(crate) fn new(
        consumer: &Consumer,
        client: JetstreamClient,
        expires: Duration,
        max_msgs: usize,
    ) -> impl Future<Output = Result<Self, JetstreamError>> {
        let subject = Subject::try_from(format!(
            "{}.CONSUMER.MSG.NEXT.{}.{}",
            client.prefix(),
            consumer.stream_name,
            consumer.name
        ));

        async move {
            let subject = subject.map_err(JetstreamError::Subject)?;
            let inbox = client.client().create_inbox_subject();
            let request = if expires.is_zero() {
                json!({ "batch": max_msgs, "no_wait": true })
            } else {
                json!({ "batch": max_msgs, "expires": expires.as_nanos() })
            };
            let payload = serde_json::to_vec(&request).map_err(JetstreamError::Json)?;

            let subscription = client
                .client()
                .subscribe(inbox.clone(), None)
                .await
                .map_err(|err| JetstreamError::Publish(PublishError::from(err)))?;
            client
                .client()
                .publish(subject)
                .reply_subject(Some(inbox))
                .payload(payload.into())
                .await
                .map_err(JetstreamError::Publish)?;

            Ok(Self {
                subscription,
                timeout: sleep(expires.saturating_add(client.request_timeout())),
                pending_msgs: max_msgs,
            })
        }
    }
}

impl Stream for ConsumerBatch {
    type Item = Result<ServerMessage, ConsumerStreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if *this.pending_msgs == 0 {
                return Poll::Ready(None);
            }

            match Pin::new(&mut *this.subscription).poll_next(cx) {
                Poll::Pending => {
                    return match this.timeout.as_mut().poll(cx) {
                        Poll::Pending => Poll::Pending,
                        Poll::Ready(()) => {
                            *this.pending_msgs = 0;
                            Poll::Ready(None)
                        }
                    };
                }
                Poll::Ready(Some(Ok(msg))) => match msg.status_code {
                    None | Some(StatusCode::OK) => {
                        *this.pending_msgs -= 1;
                        return Poll::Ready(Some(Ok(msg)));
                    }
                    Some(StatusCode::IDLE_HEARTBEAT) => {}
                    Some(StatusCode::TIMEOUT | StatusCode::NOT_FOUND) => {
                        *this.pending_msgs = 0;
                        return Poll::Ready(None);
                    }
                    Some(_) => {
                        *this.pending_msgs = 0;
                        return Poll::Ready(Some(Err(ConsumerStreamError::UnexpectedStatus(
                            Box::new(msg),
                        ))));
                    }
                },
                Poll::Ready(Some(Err(err))) => {
                    *this.pending_msgs = 0;
                    return Poll::Ready(Some(Err(ConsumerStreamError::Server(err))));
                }
                Poll::Ready(None) => {
                    *this.pending_msgs = 0;
                    return Poll::Ready(None);
                }
            }
        }
    }
}

impl FusedStream for ConsumerBatch {
    fn is_terminated(&self) -> bool {
        self.pending_msgs == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::Utc;
    use futures_util::StreamExt;
    use quince_proto::{
        headers::HeaderMap, MessageBase, ServerMessage, StatusCode, Subject, SubscriptionId,
    };

    use crate::{
        client::{Consumer, ConsumerConfig, JetstreamClient},
        core::Client,
        handler::HandlerCommand,
    };

    fn consumer() -> Consumer {
        Consumer {
            stream_name: "ORDERS".to_owned(),
            name: "worker".to_owned(),
            config: ConsumerConfig::default(),
            created_at: Utc::now(),
            num_pending: 0,
        }
    }

    fn delivery(
        id: SubscriptionId,
        status_code: Option<StatusCode>,
        payload: &'static [u8],
    ) -> ServerMessage {
        ServerMessage {
            status_code,
            subscription_id: id,
            base: MessageBase {
                subject: Subject::from_static("orders.eu"),
                reply_subject: None,
                headers: HeaderMap::new(),
                payload: Bytes::from_static(payload),
            },
        }
    }

    #[tokio::test]
    async fn pull_until_not_found() {
        let (client, mut handler) = Client::test(4);
        let jetstream = JetstreamClient::new(client).with_request_timeout(Duration::from_secs(5));

        let mut batch = Box::pin(
            jetstream
                .consumer_batch(&consumer(), Duration::ZERO, 10)
                .await
                .unwrap(),
        );

        let Some(HandlerCommand::Subscribe {
            id, subject, queue, ..
        }) = handler.receiver.recv().await
        else {
            unreachable!()
        };
        let Some(HandlerCommand::Publish { message, .. }) = handler.receiver.recv().await else {
            unreachable!()
        };
        assert_eq!("$JS.API.CONSUMER.MSG.NEXT.ORDERS.worker", message.subject.as_str());
        assert_eq!(Some(&subject), message.reply_subject.as_ref());
        assert_eq!(
            &br#"{"batch":10,"no_wait":true}"#[..],
            &message.payload[..]
        );

        queue.push(delivery(id, None, b"first"));
        queue.push(delivery(id, Some(StatusCode::IDLE_HEARTBEAT), b""));
        queue.push(delivery(id, None, b"second"));
        queue.push(delivery(id, Some(StatusCode::NOT_FOUND), b""));

        let payloads = batch
            .as_mut()
            .map(|message| message.unwrap().base.payload)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(
            vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")],
            payloads
        );
        assert!(futures_core::FusedStream::is_terminated(&batch));
    }

    #[tokio::test(start_paused = true)]
    async fn expires() {
        let (client, mut handler) = Client::test(4);
        let jetstream = JetstreamClient::new(client).with_request_timeout(Duration::from_secs(1));

        let mut batch = Box::pin(
            jetstream
                .consumer_batch(&consumer(), Duration::from_secs(2), 10)
                .await
                .unwrap(),
        );
        let Some(HandlerCommand::Subscribe { .. }) = handler.receiver.recv().await else {
            unreachable!()
        };
        let Some(HandlerCommand::Publish { message, .. }) = handler.receiver.recv().await else {
            unreachable!()
        };
        assert_eq!(
            &br#"{"batch":10,"expires":2000000000}"#[..],
            &message.payload[..]
        );

        assert!(batch.next().await.is_none());
    }
}
