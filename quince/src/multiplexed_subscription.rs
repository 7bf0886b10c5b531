use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use quince_proto::{ServerMessage, Subject};
use tokio::sync::oneshot;

use crate::{client::ClientClosedError, core::Client};

/// The reply slot of a request sent through the shared inbox
///
/// Dropping it before the response arrives releases the slot.
#[derive(Debug)]
pub(crate) struct MultiplexedSubscription {
    subscription: Option<Inner>,
}

#[derive(Debug)]
struct Inner {
    reply_subject: Subject,
    receiver: oneshot::Receiver<ServerMessage>,
    client: Client,
}

impl MultiplexedSubscription {
    pub(crate) fn new(
        reply_subject: Subject,
        receiver: oneshot::Receiver<ServerMessage>,
        client: Client,
    ) -> Self {
        Self {
            subscription: Some(Inner {
                reply_subject,
                receiver,
                client,
            }),
        }
    }

    /// Closes the slot, returning the response if it was written first
    pub(crate) fn close_and_take(&mut self) -> Option<ServerMessage> {
        let subscription = self.subscription.as_mut()?;
        subscription.receiver.close();
        let response = subscription.receiver.try_recv().ok()?;

        // the handler already forgot about the slot when it answered
        self.subscription = None;
        Some(response)
    }
}

impl Future for MultiplexedSubscription {
    type Output = Result<ServerMessage, ClientClosedError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(subscription) = self.subscription.as_mut() else {
            return Poll::Ready(Err(ClientClosedError));
        };

        match Pin::new(&mut subscription.receiver).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                self.subscription = None;
                Poll::Ready(result.map_err(|_| ClientClosedError))
            }
        }
    }
}

impl Drop for MultiplexedSubscription {
    fn drop(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };

        subscription
            .client
            .lazy_unsubscribe_multiplexed(subscription.reply_subject);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use claims::{assert_matches, assert_none, assert_some};
    use quince_proto::{headers::HeaderMap, MessageBase, ServerMessage, Subject};
    use tokio::sync::mpsc::error::TryRecvError;

    use crate::{core::Client, dispatch::MULTIPLEXED_SUBSCRIPTION_ID, handler::HandlerCommand};

    fn response(reply_subject: Subject) -> ServerMessage {
        ServerMessage {
            status_code: None,
            subscription_id: MULTIPLEXED_SUBSCRIPTION_ID,
            base: MessageBase {
                subject: reply_subject,
                reply_subject: None,
                headers: HeaderMap::new(),
                payload: Bytes::from_static(b"done"),
            },
        }
    }

    #[tokio::test]
    async fn closing_keeps_the_first_response() {
        let (client, mut handler) = Client::test(4);
        let mut subscription = client
            .multiplexed_request(Subject::from_static("svc"), HeaderMap::new(), Bytes::new())
            .await
            .unwrap();
        let HandlerCommand::RequestMultiplexed {
            reply_subject,
            reply,
            ..
        } = handler.receiver.try_recv().unwrap()
        else {
            unreachable!()
        };

        reply.send(response(reply_subject)).unwrap();
        assert_some!(subscription.close_and_take());
        drop(subscription);

        // nothing left to clean up
        assert_eq!(TryRecvError::Empty, handler.receiver.try_recv().unwrap_err());
    }

    #[tokio::test]
    async fn closing_rejects_late_responses() {
        let (client, mut handler) = Client::test(4);
        let mut subscription = client
            .multiplexed_request(Subject::from_static("svc"), HeaderMap::new(), Bytes::new())
            .await
            .unwrap();
        let HandlerCommand::RequestMultiplexed {
            reply_subject,
            reply,
            ..
        } = handler.receiver.try_recv().unwrap()
        else {
            unreachable!()
        };

        assert_none!(subscription.close_and_take());
        assert!(reply.send(response(reply_subject)).is_err());

        drop(subscription);
        assert_matches!(
            handler.receiver.try_recv(),
            Ok(HandlerCommand::UnsubscribeMultiplexed { .. })
        );
    }
}
