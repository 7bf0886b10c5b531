use std::{
    fmt::{self, Debug},
    io,
    sync::Arc,
    time::Duration,
};

use quince_proto::{
    error::ServerError,
    proto::{error::DecoderError, ClientOp, ServerOp},
    Connect, Host, Protocol, ServerAddr, ServerInfo,
};
use rustls_platform_verifier::Verifier;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time,
};
use tokio_rustls::{
    rustls::{
        self,
        crypto::CryptoProvider,
        pki_types::{InvalidDnsNameError, ServerName},
        ClientConfig,
    },
    TlsConnector,
};
use tracing::debug;

use crate::{
    auth::AuthenticationMethod, connection::ReadError, tcp::connect_tcp, Connection,
    ConnectionSecurity,
};

/// Options shared by every connection attempt of a client
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_name: Option<String>,
    /// Receive messages published by this same connection
    pub echo: bool,
    /// Ask the server to acknowledge every operation with `+OK`
    pub verbose: bool,
    /// Credentials used when the server URL doesn't embed any
    pub auth: Option<AuthenticationMethod>,
    /// Refuse to talk to servers over plaintext
    pub require_tls: bool,
    /// Upper bound of the socket, TLS and handshake phases combined
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client_name: None,
            echo: true,
            verbose: true,
            auth: None,
            require_tls: false,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// Opens and authenticates connections to NATS servers
#[derive(Clone)]
pub struct Connector {
    tls: TlsConnector,
    options: ConnectOptions,
}

/// An error encountered while connecting to a server
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("io error")]
    Io(#[source] io::Error),
    #[error("connection attempt timed out")]
    TimedOut,
    #[error("invalid DNS name")]
    InvalidDnsName(#[source] InvalidDnsNameError),
    #[error("unexpected ServerOp")]
    UnexpectedServerOp,
    #[error("decoder error")]
    Decoder(#[source] DecoderError),
    #[error("server error")]
    Server(#[source] ServerError),
    #[error("TLS is required but the server only offers plaintext")]
    TlsRequired,
}

/// An error encountered while building the TLS configuration
#[derive(Debug, thiserror::Error)]
#[error("invalid TLS configuration")]
pub struct TlsConfigError(#[source] rustls::Error);

impl Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// Builds a connector verifying certificates against the platform's
    /// trust store
    ///
    /// # Errors
    ///
    /// Returns an error if the crypto provider doesn't support any safe TLS
    /// protocol version.
    pub fn new(options: ConnectOptions) -> Result<Self, TlsConfigError> {
        let provider = Arc::new(crypto_provider());
        let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(TlsConfigError)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(Verifier::new().with_provider(provider)))
            .with_no_client_auth();

        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
            options,
        })
    }

    #[must_use]
    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Connects to `addr` and runs the handshake
    ///
    /// # Errors
    ///
    /// Returns an error if the server can't be reached, the TLS handshake
    /// fails, the server rejects `CONNECT` or the whole attempt takes longer
    /// than the configured timeout.
    pub async fn connect(
        &self,
        addr: &ServerAddr,
    ) -> Result<(Connection<ConnectionSecurity<TcpStream>>, Box<ServerInfo>), ConnectError> {
        time::timeout(self.options.connect_timeout, self.connect_inner(addr))
            .await
            .map_err(|_| ConnectError::TimedOut)?
    }

    async fn connect_inner(
        &self,
        addr: &ServerAddr,
    ) -> Result<(Connection<ConnectionSecurity<TcpStream>>, Box<ServerInfo>), ConnectError> {
        let socket = connect_tcp(addr).await.map_err(ConnectError::Io)?;
        let mut socket = ConnectionSecurity::Plain(socket);

        // `tls://` servers expect the TLS handshake before `INFO`
        if matches!(addr.protocol(), Protocol::Tls) {
            socket = self.upgrade(socket, addr).await?;
        }

        let mut conn = Connection::new(socket);
        let info = read_info(&mut conn).await?;

        if !conn.socket().is_tls() && info.tls_required {
            debug!(%addr, "server requires TLS, upgrading");
            conn = Connection::new(self.upgrade(conn.into_inner(), addr).await?);
        }
        if self.options.require_tls && !conn.socket().is_tls() {
            return Err(ConnectError::TlsRequired);
        }

        let mut connect = Connect {
            verbose: self.options.verbose,
            pedantic: false,
            require_tls: conn.socket().is_tls(),
            auth_token: None,
            username: None,
            password: None,
            client_name: self.options.client_name.clone(),
            client_lang: "rust-quince",
            client_version: env!("CARGO_PKG_VERSION"),
            protocol: 1,
            echo: self.options.echo,
            supports_no_responders: true,
            supports_headers: true,
        };
        let auth = AuthenticationMethod::from_addr(addr).or_else(|| self.options.auth.clone());
        if let Some(auth) = auth {
            auth.apply(&mut connect);
        }

        handshake(&mut conn, connect).await?;
        Ok((conn, info))
    }

    async fn upgrade(
        &self,
        socket: ConnectionSecurity<TcpStream>,
        addr: &ServerAddr,
    ) -> Result<ConnectionSecurity<TcpStream>, ConnectError> {
        let server_name = server_name(addr).map_err(ConnectError::InvalidDnsName)?;
        socket
            .upgrade_tls(&self.tls, server_name)
            .await
            .map_err(ConnectError::Io)
    }
}

/// Reads the `INFO` the server sends right after accepting a connection
///
/// # Errors
///
/// Returns an error if the socket fails or the first operation isn't `INFO`.
pub async fn read_info<S>(conn: &mut Connection<S>) -> Result<Box<ServerInfo>, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match conn.read_next().await {
        Ok(ServerOp::Info { info }) => Ok(info),
        Ok(_) => Err(ConnectError::UnexpectedServerOp),
        Err(err) => Err(err.into()),
    }
}

/// Sends `CONNECT` followed by `PING` and waits for the `PONG`
///
/// An `-ERR` received before the `PONG`, usually an authorization failure,
/// fails the handshake.
///
/// # Errors
///
/// Returns an error if the socket fails or the server rejects the connection.
pub async fn handshake<S>(conn: &mut Connection<S>, connect: Connect) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.enqueue_write_op(&ClientOp::Connect {
        connect: Box::new(connect),
    });
    conn.enqueue_write_op(&ClientOp::Ping);
    conn.write_and_flush().await.map_err(ConnectError::Io)?;

    loop {
        match conn.read_next().await? {
            // acknowledgement of a verbose `CONNECT`, the `PONG` follows
            ServerOp::Success => {}
            ServerOp::Pong => return Ok(()),
            ServerOp::Ping => {
                conn.enqueue_write_op(&ClientOp::Pong);
                conn.write_and_flush().await.map_err(ConnectError::Io)?;
            }
            ServerOp::Error { error } => return Err(ConnectError::Server(error)),
            ServerOp::Info { .. } | ServerOp::Message { .. } => {
                return Err(ConnectError::UnexpectedServerOp);
            }
        }
    }
}

impl From<ReadError> for ConnectError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Decoder(err) => Self::Decoder(err),
            ReadError::Io(err) => Self::Io(err),
        }
    }
}

fn server_name(addr: &ServerAddr) -> Result<ServerName<'static>, InvalidDnsNameError> {
    match addr.host() {
        Host::Ip(ip) => Ok(ServerName::IpAddress((*ip).into())),
        Host::Dns(name) => ServerName::try_from(name.to_string()),
    }
}

fn crypto_provider() -> CryptoProvider {
    #[cfg(feature = "aws-lc-rs")]
    return rustls::crypto::aws_lc_rs::default_provider();
    #[cfg(all(not(feature = "aws-lc-rs"), feature = "ring"))]
    return rustls::crypto::ring::default_provider();
    #[cfg(not(any(feature = "aws-lc-rs", feature = "ring")))]
    compile_error!("Please enable the `aws-lc-rs` or the `ring` feature")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use claims::{assert_matches, assert_ok};
    use quince_proto::error::ServerError;
    use tokio::{
        io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
    };

    use super::{handshake, read_info, ConnectError, ConnectOptions, Connector};
    use crate::{AuthenticationMethod, Connection};

    fn connect_op() -> quince_proto::Connect {
        quince_proto::Connect {
            verbose: true,
            pedantic: false,
            require_tls: false,
            auth_token: None,
            username: None,
            password: None,
            client_name: None,
            client_lang: "rust-quince",
            client_version: "0.0.0",
            protocol: 1,
            echo: true,
            supports_no_responders: true,
            supports_headers: true,
        }
    }

    #[tokio::test]
    async fn info_then_handshake() {
        let (socket, server) = io::duplex(4096);
        let server = tokio::spawn(async move {
            let mut server = BufReader::new(server);
            server
                .write_all(b"INFO {\"server_id\":\"S1\",\"max_payload\":2048}\r\n")
                .await
                .unwrap();

            let mut line = String::new();
            server.read_line(&mut line).await.unwrap();
            assert!(line.starts_with("CONNECT {"));
            line.clear();
            server.read_line(&mut line).await.unwrap();
            assert_eq!("PING\r\n", line);

            server.write_all(b"+OK\r\nPING\r\nPONG\r\n").await.unwrap();
            line.clear();
            server.read_line(&mut line).await.unwrap();
            assert_eq!("PONG\r\n", line);
        });

        let mut conn = Connection::new(socket);
        let info = assert_ok!(read_info(&mut conn).await);
        assert_eq!("S1", info.id);
        assert_eq!(2048, info.max_payload.get());
        assert_ok!(handshake(&mut conn, connect_op()).await);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_rejected() {
        let (socket, mut server) = io::duplex(4096);
        server
            .write_all(b"-ERR 'Authorization Violation'\r\n")
            .await
            .unwrap();

        let mut conn = Connection::new(socket);
        assert_matches!(
            handshake(&mut conn, connect_op()).await,
            Err(ConnectError::Server(ServerError::AuthorizationViolation))
        );
    }

    #[tokio::test]
    async fn first_op_must_be_info() {
        let (socket, mut server) = io::duplex(4096);
        server.write_all(b"PING\r\n").await.unwrap();

        let mut conn = Connection::new(socket);
        assert_matches!(
            read_info(&mut conn).await,
            Err(ConnectError::UnexpectedServerOp)
        );
    }

    #[tokio::test]
    async fn connect_over_tcp_with_credentials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            socket
                .write_all(b"INFO {\"server_id\":\"S1\",\"headers\":true}\r\n")
                .await
                .unwrap();

            let mut connect = String::new();
            socket.read_line(&mut connect).await.unwrap();
            let mut ping = String::new();
            socket.read_line(&mut ping).await.unwrap();
            socket.write_all(b"+OK\r\nPONG\r\n").await.unwrap();
            connect
        });

        let connector = Connector::new(ConnectOptions {
            client_name: Some("tester".to_owned()),
            auth: Some(AuthenticationMethod::Token("t0ken".to_owned())),
            ..ConnectOptions::default()
        })
        .unwrap();
        let addr = format!("nats://127.0.0.1:{port}").parse().unwrap();
        let (conn, info) = assert_ok!(connector.connect(&addr).await);
        assert!(!conn.socket().is_tls());
        assert!(info.supports_headers);

        let connect = server.await.unwrap();
        assert!(connect.contains("\"auth_token\":\"t0ken\""));
        assert!(connect.contains("\"name\":\"tester\""));
        assert!(connect.contains("\"verbose\":true"));
    }

    #[tokio::test]
    async fn plaintext_refused_when_tls_is_required() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"INFO {}\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let connector = Connector::new(ConnectOptions {
            require_tls: true,
            ..ConnectOptions::default()
        })
        .unwrap();
        let addr = format!("nats://127.0.0.1:{port}").parse().unwrap();
        assert_matches!(
            connector.connect(&addr).await,
            Err(ConnectError::TlsRequired)
        );
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let connector = Connector::new(ConnectOptions {
            connect_timeout: Duration::from_millis(100),
            ..ConnectOptions::default()
        })
        .unwrap();
        let addr = format!("nats://127.0.0.1:{port}").parse().unwrap();
        assert_matches!(connector.connect(&addr).await, Err(ConnectError::TimedOut));
    }
}
