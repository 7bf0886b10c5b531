use std::{sync::Arc, time::Duration};

use quince_net::Connector;
use quince_proto::{ServerAddr, ServerInfo};
use tokio::time;
use tracing::{debug, info, warn};

use crate::{
    client::ClientConnectError,
    events::Event,
    handler::{Handler, HandlerOutput, RecycledHandler, Transport},
    server_pool::{MaxReconnect, ServerPool},
};

#[derive(Debug, Copy, Clone)]
pub(crate) struct ReconnectConfig {
    pub(crate) allow_reconnect: bool,
    pub(crate) max_reconnect: MaxReconnect,
    pub(crate) reconnect_wait: Duration,
    pub(crate) reconnect_jitter: Duration,
    pub(crate) reconnect_jitter_tls: Duration,
}

/// Drives the connection actor and replaces it when the connection fails
#[derive(Debug)]
pub(crate) struct Supervisor {
    connector: Connector,
    config: ReconnectConfig,
}

/// Tries every server of the pool once, in order
pub(crate) async fn connect_initial(
    connector: &Connector,
    pool: &mut ServerPool,
) -> Result<(Transport, Box<ServerInfo>, ServerAddr), ClientConnectError> {
    let mut last_error = None;
    for _ in 0..pool.len() {
        let Some(addr) = pool.next_candidate() else {
            break;
        };

        pool.record_attempt(&addr);
        match connector.connect(&addr).await {
            Ok((conn, info)) => {
                info!(server = %addr, "connected");
                return Ok((conn, info, addr));
            }
            Err(err) => {
                warn!(server = %addr, error = %err, "connection attempt failed");
                pool.record_failure(&addr, MaxReconnect::Forever);
                last_error = Some(err);
            }
        }
    }

    Err(ClientConnectError::NoServersAvailable { last_error })
}

impl Supervisor {
    pub(crate) fn new(connector: Connector, config: ReconnectConfig) -> Self {
        Self { connector, config }
    }

    pub(crate) async fn run(self, mut handler: Handler) {
        loop {
            let output = (&mut handler).await;
            let addr = handler.addr().clone();
            let recycle = handler.recycle().await;

            match output {
                HandlerOutput::Closed => return finalize(recycle),
                HandlerOutput::ServerError(err) => {
                    warn!(server = %addr, error = %err, "connection closed by server error");
                }
                HandlerOutput::UnexpectedState => {
                    warn!(server = %addr, "unexpected server response, reconnecting");
                }
                HandlerOutput::StaleConnection => {
                    info!(server = %addr, "stale connection, reconnecting");
                }
                HandlerOutput::Disconnected => info!(server = %addr, "disconnected"),
            }

            let allow_reconnect = self.config.allow_reconnect;
            if allow_reconnect {
                recycle.shared.state.set_reconnecting();
            }
            recycle.shared.events.emit(Event::Disconnected(addr));
            if !allow_reconnect {
                return finalize(recycle);
            }

            match self.reconnect(recycle).await {
                Ok(new_handler) => handler = new_handler,
                Err(recycle) => return finalize(recycle),
            }
        }
    }

    /// Cycles through the pool until a server accepts the connection
    ///
    /// Gives the state back if the pool runs out of servers or the client
    /// is closed in the meantime.
    async fn reconnect(&self, mut recycle: RecycledHandler) -> Result<Handler, RecycledHandler> {
        let close_requested = recycle.shared.close_requested.clone();

        loop {
            let Some(addr) = recycle.pool.next_candidate() else {
                warn!("no servers left to reconnect to");
                return Err(recycle);
            };

            let delay = recycle.pool.delay_before(
                &addr,
                self.config.reconnect_wait,
                self.config.reconnect_jitter,
                self.config.reconnect_jitter_tls,
            );
            tokio::select! {
                () = close_requested.cancelled() => return Err(recycle),
                () = time::sleep(delay) => {}
            }

            recycle.pool.record_attempt(&addr);
            debug!(server = %addr, "reconnecting");
            let result = tokio::select! {
                () = close_requested.cancelled() => return Err(recycle),
                result = self.connector.connect(&addr) => result,
            };

            match result {
                Ok((conn, info)) => {
                    let shared = Arc::clone(&recycle.shared);
                    shared.stats.record_reconnect();
                    let handler = Handler::new(conn, info, addr.clone(), recycle);
                    shared.state.set_connected();
                    info!(server = %addr, "reconnected");
                    shared.events.emit(Event::Reconnected(addr));
                    return Ok(handler);
                }
                Err(err) => {
                    warn!(server = %addr, error = %err, "reconnect attempt failed");
                    if recycle.pool.record_failure(&addr, self.config.max_reconnect) {
                        info!(server = %addr, "giving up on server");
                    }
                    recycle
                        .shared
                        .servers
                        .store(Arc::new(recycle.pool.snapshot()));
                }
            }
        }
    }
}

fn finalize(recycle: RecycledHandler) {
    let shared = Arc::clone(&recycle.shared);
    shared.state.set_closed();
    recycle.shutdown();

    info!("client closed");
    shared.events.emit(Event::Closed);
    shared.closed.cancel();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use claims::{assert_matches, assert_ok};
    use quince_proto::{ServerAddr, Subject};
    use tokio::{net::TcpListener, sync::mpsc, time};

    use crate::{
        client::{
            ClientBuilder, ClientConnectError, PublishError, ResponseError, SubscribeError,
        },
        core::{Client, ConnectionState, MaxReconnect},
        events::tests::{next_event, RecordingListener},
        tests::mock_server::MockServer,
    };

    fn builder(server: &MockServer) -> ClientBuilder {
        Client::builder()
            .servers([server.addr()])
            .reconnect_wait(Duration::from_millis(20))
            .reconnect_jitter(Duration::ZERO, Duration::ZERO)
    }

    #[tokio::test]
    async fn publish_and_flush() {
        let server = MockServer::bind().await;
        let (client, mut conn) = tokio::join!(builder(&server).connect(), server.accept());
        let client = client.unwrap();
        assert_eq!(ConnectionState::Connected, client.state());
        assert_eq!(server.port(), client.connected_server().port());

        client
            .publish(Subject::from_static("orders.new"))
            .payload(Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!("PUB orders.new 5", conn.read_line().await);
        assert_eq!("hello", conn.read_line().await);

        let (flushed, ()) = tokio::join!(client.flush(Duration::from_secs(5)), async {
            assert_eq!("PING", conn.read_line().await);
            conn.write(b"PONG\r\n").await;
        });
        assert_ok!(flushed);

        let (rtt, ()) = tokio::join!(client.rtt(), async {
            assert_eq!("PING", conn.read_line().await);
            conn.write(b"PONG\r\n").await;
        });
        assert_ok!(rtt);

        let stats = client.statistics();
        assert_eq!(1, stats.out_messages());
        assert_eq!(5, stats.out_bytes());

        client.close().await;
        assert_eq!(ConnectionState::Closed, client.state());
        conn.closed().await;
    }

    #[tokio::test]
    async fn no_servers_available() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let addr = format!("nats://127.0.0.1:{port}")
            .parse::<ServerAddr>()
            .unwrap();
        let result = Client::builder()
            .servers([addr])
            .connect_timeout(Duration::from_secs(1))
            .connect()
            .await;
        assert_matches!(
            result,
            Err(ClientConnectError::NoServersAvailable {
                last_error: Some(_)
            })
        );
    }

    #[tokio::test]
    async fn reconnect_resubscribes_and_replays_buffered_publishes() {
        let server = MockServer::bind().await;
        let (recording, mut events) = RecordingListener::new();
        let (client, mut conn) = tokio::join!(
            builder(&server).event_listener(recording).connect(),
            server.accept()
        );
        let client = client.unwrap();

        let mut subscription = client
            .subscribe(Subject::from_static("orders"), None)
            .await
            .unwrap();
        assert_eq!("SUB orders 2", conn.read_line().await);

        drop(conn);
        assert_eq!(
            format!("disconnected {}", server.port()),
            next_event(&mut events).await
        );
        assert_eq!(ConnectionState::Reconnecting, client.state());

        // the handshake can't complete before the server accepts
        client
            .publish(Subject::from_static("audit"))
            .payload(Bytes::from_static(b"x"))
            .await
            .unwrap();

        let mut conn = server.accept().await;
        assert_eq!("SUB orders 2", conn.read_line().await);
        assert_eq!("PUB audit 1", conn.read_line().await);
        assert_eq!("x", conn.read_line().await);
        assert_eq!(
            format!("reconnected {}", server.port()),
            next_event(&mut events).await
        );
        assert_eq!(ConnectionState::Connected, client.state());
        assert_eq!(1, client.statistics().reconnects());

        conn.write(b"MSG orders 2 2\r\nhi\r\n").await;
        let message = subscription
            .next_message(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(Bytes::from_static(b"hi"), message.base.payload);
    }

    #[tokio::test]
    async fn drain_delivers_in_flight_messages_then_closes() {
        let server = MockServer::bind().await;
        let (recording, mut events) = RecordingListener::new();
        let (client, mut conn) = tokio::join!(
            builder(&server).event_listener(recording).connect(),
            server.accept()
        );
        let client = client.unwrap();

        let (sender, mut received) = mpsc::unbounded_channel();
        let _subscription = client
            .subscribe_with_handler(Subject::from_static("jobs"), None, move |message| {
                let _ = sender.send(message.base.payload);
            })
            .await
            .unwrap();
        assert_eq!("SUB jobs 2", conn.read_line().await);

        let (drained, ()) = tokio::join!(client.drain(Duration::from_secs(5)), async {
            assert_eq!("UNSUB 2", conn.read_line().await);
            assert_eq!("PING", conn.read_line().await);
            conn.write(b"MSG jobs 2 1\r\na\r\nPONG\r\n").await;
            assert_eq!("PING", conn.read_line().await);
            conn.write(b"PONG\r\n").await;
        });
        assert_ok!(drained);
        assert_eq!(ConnectionState::Closed, client.state());
        assert_eq!(Some(Bytes::from_static(b"a")), received.recv().await);
        assert_eq!("closed", next_event(&mut events).await);

        assert_matches!(
            client.subscribe(Subject::from_static("jobs"), None).await,
            Err(SubscribeError::Closed(_))
        );
        assert_matches!(
            client
                .publish(Subject::from_static("jobs"))
                .payload(Bytes::new())
                .await,
            Err(PublishError::Closed(_))
        );
        conn.closed().await;
    }

    #[tokio::test]
    async fn request_reply() {
        let server = MockServer::bind().await;
        let (client, mut conn) = tokio::join!(builder(&server).connect(), server.accept());
        let client = client.unwrap();

        let (response, ()) = tokio::join!(
            async {
                client
                    .request(Subject::from_static("svc.echo"))
                    .payload(Bytes::from_static(b"ping"))
                    .await
                    .unwrap()
                    .await
            },
            async {
                let subscribe = conn.read_line().await;
                let prefix = subscribe
                    .strip_prefix("SUB ")
                    .and_then(|line| line.strip_suffix(".* 1"))
                    .unwrap()
                    .to_owned();

                let publish = conn.read_line().await;
                let parts = publish.split(' ').collect::<Vec<_>>();
                assert_eq!(["PUB", "svc.echo"], parts[..2]);
                assert!(parts[2].starts_with(&prefix));
                assert_eq!("4", parts[3]);
                assert_eq!("ping", conn.read_line().await);

                conn.write(format!("MSG {} 1 4\r\npong\r\n", parts[2]).as_bytes())
                    .await;
            }
        );
        assert_eq!(Bytes::from_static(b"pong"), response.unwrap().base.payload);

        let (response, ()) = tokio::join!(
            async {
                client
                    .request(Subject::from_static("svc.missing"))
                    .payload(Bytes::new())
                    .await
                    .unwrap()
                    .await
            },
            async {
                let publish = conn.read_line().await;
                let reply_subject = publish.split(' ').nth(2).unwrap().to_owned();
                assert_eq!("", conn.read_line().await);

                conn.write(
                    format!("HMSG {reply_subject} 1 16 16\r\nNATS/1.0 503\r\n\r\n\r\n").as_bytes(),
                )
                .await;
            }
        );
        assert_matches!(response, Err(ResponseError::NoResponders));
    }

    #[tokio::test]
    async fn discovery_and_lame_duck() {
        let server = MockServer::bind().await;
        let (recording, mut events) = RecordingListener::new();
        let (client, mut conn) = tokio::join!(
            builder(&server).event_listener(recording).connect(),
            server.accept_with_info(r#"{"connect_urls":["127.0.0.1:6001"]}"#)
        );
        let client = client.unwrap();
        assert_eq!(
            vec![6001],
            client
                .discovered_servers()
                .iter()
                .map(ServerAddr::port)
                .collect::<Vec<_>>()
        );
        assert!(!client.is_lame_duck());

        conn.write(b"INFO {\"connect_urls\":[\"127.0.0.1:6002\"],\"ldm\":true}\r\n")
            .await;
        assert_eq!(
            format!("lame duck {}", server.port()),
            next_event(&mut events).await
        );
        assert_eq!("discovered 6002", next_event(&mut events).await);
        assert!(client.is_lame_duck());
        assert_eq!(
            vec![6002],
            client
                .discovered_servers()
                .iter()
                .map(ServerAddr::port)
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn closing_twice_reports_closed_once() {
        let server = MockServer::bind().await;
        let (recording, mut events) = RecordingListener::new();
        let (client, conn) = tokio::join!(
            builder(&server).event_listener(recording).connect(),
            server.accept()
        );
        let client = client.unwrap();

        client.close().await;
        client.close().await;
        assert_eq!("closed", next_event(&mut events).await);
        conn.closed().await;

        time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn disallowed_reconnect_closes() {
        let server = MockServer::bind().await;
        let (recording, mut events) = RecordingListener::new();
        let (client, conn) = tokio::join!(
            builder(&server)
                .allow_reconnect(false)
                .event_listener(recording)
                .connect(),
            server.accept()
        );
        let client = client.unwrap();

        drop(conn);
        assert_eq!(
            format!("disconnected {}", server.port()),
            next_event(&mut events).await
        );
        assert_eq!("closed", next_event(&mut events).await);
        assert_eq!(ConnectionState::Closed, client.state());
    }

    #[tokio::test]
    async fn gives_up_after_max_reconnect() {
        let server = MockServer::bind().await;
        let port = server.port();
        let (recording, mut events) = RecordingListener::new();
        let (client, conn) = tokio::join!(
            builder(&server)
                .max_reconnect(MaxReconnect::Attempts(1))
                .event_listener(recording)
                .connect(),
            server.accept()
        );
        let client = client.unwrap();

        drop(server);
        drop(conn);
        assert_eq!(format!("disconnected {port}"), next_event(&mut events).await);
        assert_eq!("closed", next_event(&mut events).await);
        assert_eq!(ConnectionState::Closed, client.state());
        assert!(client.servers().is_empty());
    }
}
