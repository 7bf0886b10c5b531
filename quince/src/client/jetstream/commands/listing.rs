use std::{
    collections::VecDeque,
    fmt::Display,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures_core::{future::BoxFuture, FusedStream, Stream};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;

use crate::client::{self, JetstreamClient, JetstreamError};

/// A request to list streams
///
/// Obtained from [`JetstreamClient::streams`].
#[derive(Debug)]
#[must_use = "streams do nothing unless polled"]
pub struct Streams {
    listing: Listing<client::Stream>,
}

/// A request to list consumers of a stream
///
/// Obtained from [`JetstreamClient::consumers`].
#[derive(Debug)]
#[must_use = "streams do nothing unless polled"]
pub struct Consumers {
    listing: Listing<client::Consumer>,
}

/// Walks a paginated Jetstream listing one page at a time
struct Listing<T> {
    client: JetstreamClient,
    endpoint: String,
    offset: usize,
    fetch: Option<BoxFuture<'static, Result<Page<T>, JetstreamError>>>,
    buffer: VecDeque<T>,
    exhausted: bool,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    total: usize,
    #[serde(alias = "streams", alias = "consumers", default = "Option::default")]
    items: Option<VecDeque<T>>,
}

impl Streams {
    pub(crate) fn new(client: JetstreamClient) -> Self {
        Self {
            listing: Listing::new(client, "STREAM.LIST".to_owned()),
        }
    }
}

impl Consumers {
    pub(crate) fn new(client: JetstreamClient, stream_name: impl Display) -> Self {
        Self {
            listing: Listing::new(client, format!("CONSUMER.LIST.{stream_name}")),
        }
    }
}

impl<T> Listing<T>
where
    T: DeserializeOwned + Send + Unpin + 'static,
{
    fn new(client: JetstreamClient, endpoint: String) -> Self {
        Self {
            client,
            endpoint,
            offset: 0,
            fetch: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn poll_item(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<T, JetstreamError>>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Poll::Ready(Some(Ok(item)));
            }
            if self.exhausted {
                return Poll::Ready(None);
            }

            let fetch = self.fetch.get_or_insert_with(|| {
                let client = self.client.clone();
                let endpoint = self.endpoint.clone();
                let payload = json!({ "offset": self.offset }).to_string();

                Box::pin(async move { client.api_request(endpoint, payload.into()).await })
            });

            match Pin::new(fetch).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(page)) => {
                    self.fetch = None;
                    self.buffer = page.items.unwrap_or_default();
                    self.offset += self.buffer.len();
                    self.exhausted = self.buffer.is_empty() || self.offset >= page.total;
                }
                Poll::Ready(Err(err)) => {
                    self.fetch = None;
                    self.exhausted = true;
                    return Poll::Ready(Some(Err(err)));
                }
            }
        }
    }
}

impl Stream for Streams {
    type Item = Result<client::Stream, JetstreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().listing.poll_item(cx)
    }
}

impl FusedStream for Streams {
    fn is_terminated(&self) -> bool {
        self.listing.is_terminated()
    }
}

impl Stream for Consumers {
    type Item = Result<client::Consumer, JetstreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().listing.poll_item(cx)
    }
}

impl FusedStream for Consumers {
    fn is_terminated(&self) -> bool {
        self.listing.is_terminated()
    }
}

impl<T> Listing<T> {
    fn is_terminated(&self) -> bool {
        self.buffer.is_empty() && self.exhausted
    }
}

impl<T> std::fmt::Debug for Listing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listing")
            .field("endpoint", &self.endpoint)
            .field("offset", &self.offset)
            .field("buffered", &self.buffer.len())
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;
    use serde_json::json;

    use crate::{
        client::{
            jetstream::tests::{respond, stream_json},
            JetstreamClient,
        },
        core::Client,
    };

    #[tokio::test]
    async fn streams_follow_offsets() {
        let (client, mut handler) = Client::test(4);
        let jetstream = JetstreamClient::new(client).with_request_timeout(Duration::from_secs(5));

        let (names, ()) = tokio::join!(
            jetstream
                .streams()
                .map(|stream| stream.unwrap().config.name)
                .collect::<Vec<_>>(),
            async {
                let first = json!({
                    "total": 3,
                    "offset": 0,
                    "limit": 2,
                    "streams": [stream_json("A", &["a"]), stream_json("B", &["b"])],
                });
                let (subject, request) = respond(&mut handler, first.to_string().as_bytes()).await;
                assert_eq!("$JS.API.STREAM.LIST", subject);
                assert_eq!(&br#"{"offset":0}"#[..], &request[..]);

                let second = json!({
                    "total": 3,
                    "offset": 2,
                    "limit": 2,
                    "streams": [stream_json("C", &["c"])],
                });
                let (_, request) = respond(&mut handler, second.to_string().as_bytes()).await;
                assert_eq!(&br#"{"offset":2}"#[..], &request[..]);
            }
        );
        assert_eq!(vec!["A", "B", "C"], names);
    }

    #[tokio::test]
    async fn empty_consumer_list() {
        let (client, mut handler) = Client::test(4);
        let jetstream = JetstreamClient::new(client).with_request_timeout(Duration::from_secs(5));

        let (consumers, (subject, _)) = tokio::join!(
            jetstream.consumers("ORDERS").collect::<Vec<_>>(),
            respond(
                &mut handler,
                br#"{"total":0,"offset":0,"limit":256,"consumers":null}"#
            )
        );
        assert_eq!("$JS.API.CONSUMER.LIST.ORDERS", subject);
        assert!(consumers.is_empty());
    }
}
