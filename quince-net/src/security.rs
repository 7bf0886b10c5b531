use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::{client::TlsStream, rustls::pki_types::ServerName, TlsConnector};

/// A socket that is either plaintext or wrapped in TLS
#[derive(Debug)]
#[expect(
    clippy::large_enum_variant,
    reason = "boxing the TLS state would penalize the common secure case"
)]
pub enum ConnectionSecurity<S> {
    Plain(S),
    Tls(TlsStream<S>),
}

impl<S> ConnectionSecurity<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[must_use]
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Runs the TLS handshake over a plaintext socket
    ///
    /// An already secured socket is returned unchanged.
    pub(crate) async fn upgrade_tls(
        self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> io::Result<Self> {
        match self {
            Self::Plain(socket) => connector
                .connect(server_name, socket)
                .await
                .map(Self::Tls),
            tls @ Self::Tls(_) => Ok(tls),
        }
    }
}

macro_rules! delegate {
    ($this:expr, $socket:ident => $call:expr) => {
        match $this {
            Self::Plain($socket) => $call,
            Self::Tls($socket) => $call,
        }
    };
}

impl<S> AsyncRead for ConnectionSecurity<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        delegate!(self.get_mut(), socket => Pin::new(socket).poll_read(cx, buf))
    }
}

impl<S> AsyncWrite for ConnectionSecurity<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        delegate!(self.get_mut(), socket => Pin::new(socket).poll_write(cx, buf))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        delegate!(self.get_mut(), socket => Pin::new(socket).poll_write_vectored(cx, bufs))
    }

    fn is_write_vectored(&self) -> bool {
        delegate!(self, socket => socket.is_write_vectored())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self.get_mut(), socket => Pin::new(socket).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self.get_mut(), socket => Pin::new(socket).poll_shutdown(cx))
    }
}
