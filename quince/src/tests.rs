use std::{sync::Arc, task::Waker, time::Duration};

use bytes::Bytes;
use futures_util::task::ArcWake;
use quince_net::{Connection, ConnectionSecurity};
use quince_proto::{
    headers::HeaderMap, MessageBase, ServerAddr, ServerInfo, ServerMessage, StatusCode, Subject,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::mpsc,
    time::timeout,
};

use crate::{
    atomic::{AtomicUsize, Ordering},
    client::{create_inbox_subject, ClientShared},
    dispatch::MULTIPLEXED_SUBSCRIPTION_ID,
    handler::{Handler, HandlerCommand, HandlerConfig, RecycledHandler},
    server_pool::ServerPool,
};

#[derive(Debug)]
pub(crate) struct FlagWaker(AtomicUsize);

impl FlagWaker {
    pub(crate) fn new() -> (Arc<Self>, Waker) {
        let this = Arc::new(Self(AtomicUsize::new(0)));
        let waker = futures_util::task::waker(Arc::clone(&this));
        (this, waker)
    }

    pub(crate) fn wakes(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

impl ArcWake for FlagWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.fetch_add(1, Ordering::AcqRel);
    }
}

/// A message answering a request through the shared inbox
pub(crate) fn response_message(
    subject: Subject,
    status_code: Option<StatusCode>,
    payload: &[u8],
) -> ServerMessage {
    ServerMessage {
        status_code,
        subscription_id: MULTIPLEXED_SUBSCRIPTION_ID,
        base: MessageBase {
            subject,
            reply_subject: None,
            headers: HeaderMap::new(),
            payload: Bytes::copy_from_slice(payload),
        },
    }
}

/// The server end of a test connection, speaking the protocol line by line
#[derive(Debug)]
pub(crate) struct ServerSide {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ServerSide {
    fn new(socket: TcpStream) -> Self {
        let (reader, writer) = socket.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Reads the next line without the trailing `\r\n`
    ///
    /// Returns an empty string once the client closed the connection.
    pub(crate) async fn read_line(&mut self) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(600), self.reader.read_line(&mut line))
            .await
            .expect("no line received in time")
            .expect("read failed");
        line.trim_end_matches(['\r', '\n']).to_owned()
    }

    pub(crate) async fn write(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write failed");
    }

    /// Waits for the client to go away
    pub(crate) async fn closed(mut self) {
        while !self.read_line().await.is_empty() {}
    }
}

/// A handler connected to a [`ServerSide`], not yet spawned
pub(crate) async fn handler_pair() -> (Handler, mpsc::Sender<HandlerCommand>, ServerSide) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap();
    let (client, server) = tokio::join!(TcpStream::connect(local), listener.accept());
    let conn = Connection::new(ConnectionSecurity::Plain(client.unwrap()));
    let (server, _) = server.unwrap();

    let shared = Arc::new(ClientShared::test());
    shared.state.set_connected();
    let addr = format!("nats://{local}").parse::<ServerAddr>().unwrap();
    let (sender, receiver) = mpsc::channel(16);
    let recycle = RecycledHandler::new(
        shared,
        ServerPool::new(vec![addr.clone()], false),
        HandlerConfig {
            ping_interval: Duration::from_secs(60),
            max_pings_out: 2,
            flush_interval: Duration::ZERO,
        },
        receiver,
        create_inbox_subject(&Subject::from_static("_INBOX")),
    );
    let info = serde_json::from_str::<Box<ServerInfo>>(r#"{"max_payload":1048576}"#).unwrap();
    let handler = Handler::new(conn, info, addr, recycle);

    (handler, sender, ServerSide::new(server))
}

pub(crate) mod mock_server {
    use quince_proto::ServerAddr;
    use tokio::net::TcpListener;

    use super::ServerSide;

    /// A scripted NATS server accepting one connection at a time
    #[derive(Debug)]
    pub(crate) struct MockServer {
        listener: TcpListener,
        port: u16,
    }

    impl MockServer {
        pub(crate) async fn bind() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            Self { listener, port }
        }

        pub(crate) fn port(&self) -> u16 {
            self.port
        }

        pub(crate) fn addr(&self) -> ServerAddr {
            format!("nats://127.0.0.1:{}", self.port).parse().unwrap()
        }

        /// Accepts a connection and completes the handshake
        pub(crate) async fn accept(&self) -> ServerSide {
            self.accept_with_info(&format!(r#"{{"server_id":"mock","port":{}}}"#, self.port))
                .await
        }

        /// Accepts a connection, announcing `info` in the `INFO` line
        pub(crate) async fn accept_with_info(&self, info: &str) -> ServerSide {
            let (socket, _) = self.listener.accept().await.unwrap();
            let mut server = ServerSide::new(socket);
            server.write(format!("INFO {info}\r\n").as_bytes()).await;

            let connect = server.read_line().await;
            assert!(connect.starts_with("CONNECT {"), "got {connect:?}");
            assert_eq!("PING", server.read_line().await);
            server.write(b"PONG\r\n").await;
            server
        }
    }
}
