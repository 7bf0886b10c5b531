use std::{
    future::{self, Future},
    io,
    pin::{pin, Pin},
    task::{Context, Poll},
};

use bytes::Buf;
use quince_proto::proto::{error::DecoderError, ClientOp, ServerOp, StreamDecoder, StreamEncoder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Once this many bytes are waiting to be written, callers should stop
/// enqueueing and let the socket catch up
const WRITE_BACKPRESSURE_THRESHOLD: usize = 8 * 1024 * 1024;

/// A socket speaking the NATS client protocol
///
/// Reads are decoded into [`ServerOp`]s, [`ClientOp`]s are encoded into an
/// internal buffer and written out by [`Connection::poll_write_next`].
#[derive(Debug)]
pub struct Connection<S> {
    socket: S,
    encoder: StreamEncoder,
    decoder: StreamDecoder,
    unflushed: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[must_use]
    pub fn new(socket: S) -> Self {
        Self {
            socket,
            encoder: StreamEncoder::new(),
            decoder: StreamDecoder::new(),
            unflushed: false,
        }
    }

    /// Polls for the next operation sent by the server
    ///
    /// A clean EOF is reported as [`io::ErrorKind::UnexpectedEof`], the
    /// server never closes a healthy connection.
    pub fn poll_read_next(&mut self, cx: &mut Context<'_>) -> Poll<Result<ServerOp, ReadError>> {
        loop {
            if let Some(op) = self.decoder.decode().map_err(ReadError::Decoder)? {
                return Poll::Ready(Ok(op));
            }

            let read = pin!(self.socket.read_buf(self.decoder.read_buf()));
            match read.poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(ReadError::Io(io::ErrorKind::UnexpectedEof.into())));
                }
                Poll::Ready(Ok(_)) => {}
                Poll::Ready(Err(err)) => return Poll::Ready(Err(ReadError::Io(err))),
            }
        }
    }

    /// Reads the next operation sent by the server
    ///
    /// # Errors
    ///
    /// Returns an error if the socket fails or the stream can't be decoded.
    pub async fn read_next(&mut self) -> Result<ServerOp, ReadError> {
        future::poll_fn(|cx| self.poll_read_next(cx)).await
    }

    pub fn enqueue_write_op(&mut self, op: &ClientOp) {
        self.encoder.enqueue_write_op(op);
    }

    /// Returns `false` once the write buffer is large enough that more
    /// operations should wait
    #[must_use]
    pub fn may_enqueue_more_ops(&self) -> bool {
        self.encoder.remaining() < WRITE_BACKPRESSURE_THRESHOLD
    }

    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        self.encoder.has_remaining()
    }

    /// Returns `true` if bytes were written since the last flush
    #[must_use]
    pub fn should_flush(&self) -> bool {
        self.unflushed
    }

    /// Writes as much of the write buffer as the socket accepts in one call
    ///
    /// Resolves to `0` when there was nothing to write.
    pub fn poll_write_next(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        if !self.encoder.has_remaining() {
            return Poll::Ready(Ok(0));
        }

        let socket = Pin::new(&mut self.socket);
        let written = if socket.is_write_vectored() {
            let mut slices = [io::IoSlice::new(&[]); 64];
            let n = self.encoder.chunks_vectored(&mut slices);
            socket.poll_write_vectored(cx, &slices[..n])
        } else {
            socket.poll_write(cx, self.encoder.chunk())
        };

        let n = match written {
            Poll::Ready(Ok(0)) => return Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
            Poll::Ready(Ok(n)) => n,
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            Poll::Pending => return Poll::Pending,
        };
        self.encoder.advance(n);
        self.unflushed = true;
        Poll::Ready(Ok(n))
    }

    /// # Errors
    ///
    /// Returns an error if the socket fails.
    pub async fn write_next(&mut self) -> io::Result<usize> {
        future::poll_fn(|cx| self.poll_write_next(cx)).await
    }

    pub fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = std::task::ready!(Pin::new(&mut self.socket).poll_flush(cx));
        if result.is_ok() {
            self.unflushed = false;
        }
        Poll::Ready(result)
    }

    /// # Errors
    ///
    /// Returns an error if the socket fails.
    pub async fn flush(&mut self) -> io::Result<()> {
        future::poll_fn(|cx| self.poll_flush(cx)).await
    }

    /// Writes the whole write buffer, then flushes the socket
    ///
    /// # Errors
    ///
    /// Returns an error if the socket fails.
    pub async fn write_and_flush(&mut self) -> io::Result<()> {
        while self.has_pending_writes() {
            self.write_next().await?;
        }
        self.flush().await
    }

    /// Shuts down the write half of the socket
    ///
    /// # Errors
    ///
    /// Returns an error if the socket fails. Callers closing the connection
    /// usually ignore it.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        future::poll_fn(|cx| Pin::new(&mut self.socket).poll_shutdown(cx)).await
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    /// Returns the socket, dropping anything still buffered
    pub fn into_inner(self) -> S {
        self.socket
    }
}

/// An error encountered while reading from a [`Connection`]
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("failed to decode the server stream")]
    Decoder(#[source] DecoderError),
    #[error("socket error")]
    Io(#[source] io::Error),
}
