use alloc::collections::VecDeque;
use core::fmt::{self, Write as _};
#[cfg(feature = "std")]
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::MessageBase;

use super::ClientOp;

/// Payloads at least this big are queued as their own chunk instead of
/// being copied into the write buffer
const COPY_THRESHOLD: usize = 4096;

/// Write-combining encoder of client operations
///
/// Control lines and small payloads are copied into a contiguous buffer,
/// large payloads are queued by reference. The encoder implements [`Buf`]
/// so the transport can write it out, vectored when possible.
#[derive(Debug, Default)]
pub struct StreamEncoder {
    chunks: VecDeque<Bytes>,
    chunks_len: usize,
    tail: BytesMut,
}

impl StreamEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes `op` at the end of the write buffer
    pub fn enqueue_write_op(&mut self, op: &ClientOp) {
        match op {
            ClientOp::Publish { message } => self.encode_publish(message),
            ClientOp::Subscribe {
                id,
                subject,
                queue_group: Some(queue_group),
            } => self.put_fmt(format_args!("SUB {subject} {queue_group} {id}\r\n")),
            ClientOp::Subscribe {
                id,
                subject,
                queue_group: None,
            } => self.put_fmt(format_args!("SUB {subject} {id}\r\n")),
            ClientOp::Unsubscribe {
                id,
                max_messages: Some(max_messages),
            } => self.put_fmt(format_args!("UNSUB {id} {max_messages}\r\n")),
            ClientOp::Unsubscribe {
                id,
                max_messages: None,
            } => self.put_fmt(format_args!("UNSUB {id}\r\n")),
            ClientOp::Connect { connect } => {
                self.tail.put_slice(b"CONNECT ");
                let json = serde_json::to_vec(&**connect).expect("serialize `Connect`");
                self.tail.put_slice(&json);
                self.tail.put_slice(b"\r\n");
            }
            ClientOp::Ping => self.tail.put_slice(b"PING\r\n"),
            ClientOp::Pong => self.tail.put_slice(b"PONG\r\n"),
        }
    }

    fn encode_publish(&mut self, message: &MessageBase) {
        let MessageBase {
            subject,
            reply_subject,
            headers,
            payload,
        } = message;

        let verb = if headers.is_empty() { "PUB" } else { "HPUB" };
        self.put_fmt(format_args!("{verb} {subject} "));
        if let Some(reply_subject) = reply_subject {
            self.put_fmt(format_args!("{reply_subject} "));
        }

        if headers.is_empty() {
            self.put_fmt(format_args!("{}\r\n", payload.len()));
        } else {
            let headers_len = headers.encoded_len();
            let total_len = headers_len + payload.len();
            self.put_fmt(format_args!("{headers_len} {total_len}\r\n"));
            headers.encode(|chunk| self.tail.put_slice(chunk));
        }

        if payload.len() < COPY_THRESHOLD {
            self.tail.put_slice(payload);
        } else {
            self.seal_tail();
            self.chunks_len += payload.len();
            self.chunks.push_back(payload.clone());
        }
        self.tail.put_slice(b"\r\n");
    }

    fn put_fmt(&mut self, args: fmt::Arguments<'_>) {
        // `BytesMut` grows on demand, so formatting into it can't fail
        let _ = self.tail.write_fmt(args);
    }

    /// Moves the pending small writes behind the queued chunks
    fn seal_tail(&mut self) {
        if !self.tail.is_empty() {
            let sealed = self.tail.split().freeze();
            self.chunks_len += sealed.len();
            self.chunks.push_back(sealed);
        }
    }
}

impl Buf for StreamEncoder {
    fn remaining(&self) -> usize {
        self.chunks_len + self.tail.len()
    }

    fn chunk(&self) -> &[u8] {
        match self.chunks.front() {
            Some(chunk) => chunk,
            None => &self.tail,
        }
    }

    #[cfg(feature = "std")]
    fn chunks_vectored<'a>(&'a self, dst: &mut [io::IoSlice<'a>]) -> usize {
        let sources = self
            .chunks
            .iter()
            .map(|chunk| &chunk[..])
            .chain((!self.tail.is_empty()).then_some(&self.tail[..]));

        let mut filled = 0;
        for (slot, source) in dst.iter_mut().zip(sources) {
            *slot = io::IoSlice::new(source);
            filled += 1;
        }
        filled
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(
            cnt <= self.remaining(),
            "advance out of range ({cnt} > {})",
            self.remaining()
        );

        while cnt > 0 {
            let Some(front) = self.chunks.front_mut() else {
                self.tail.advance(cnt);
                return;
            };

            let n = cnt.min(front.len());
            front.advance(n);
            self.chunks_len -= n;
            cnt -= n;
            if front.is_empty() {
                self.chunks.pop_front();
            }
        }
    }
}
