use alloc::boxed::Box;
use core::mem;

use bytes::{BufMut, Bytes, BytesMut};
use bytestring::ByteString;

use crate::{
    error::{ServerError, StatusCodeError},
    headers::{
        error::{HeaderNameValidateError, HeaderValueValidateError},
        HeaderMap, HeaderName, HeaderValue,
    },
    util::{self, ParseUintError},
    MessageBase, ServerMessage, StatusCode, Subject, SubscriptionId,
};

use super::ServerOp;

const INITIAL_CAPACITY: usize = 64 * 1024;
const MAX_CONTROL_LINE_LEN: usize = 16 * 1024;
const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// Incremental decoder of the server byte stream
///
/// Bytes read from the transport are appended to [`StreamDecoder::read_buf`],
/// then [`StreamDecoder::decode`] is called until it returns `Ok(None)`.
/// A frame split across reads is simply completed by a later read.
#[derive(Debug)]
pub struct StreamDecoder {
    buf: BytesMut,
    state: State,
}

#[derive(Debug)]
enum State {
    /// Looking for the `\r\n` ending a control line. `scanned` bytes were
    /// already searched without finding it.
    ControlLine { scanned: usize },
    /// A `MSG`/`HMSG` control line was parsed, waiting for its body
    Body(Box<PendingMessage>),
    Poisoned,
}

#[derive(Debug)]
struct PendingMessage {
    subscription_id: SubscriptionId,
    subject: Subject,
    reply_subject: Option<Subject>,
    header_len: usize,
    total_len: usize,
}

enum ControlLine {
    Op(ServerOp),
    Message(Box<PendingMessage>),
}

impl StreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            state: State::ControlLine { scanned: 0 },
        }
    }

    /// The buffer incoming bytes must be written to
    pub fn read_buf(&mut self) -> &mut impl BufMut {
        &mut self.buf
    }

    /// Number of buffered bytes not yet decoded
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decodes the next complete operation
    ///
    /// Returns `Ok(None)` when the buffer doesn't yet hold a complete frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is malformed. The decoder is poisoned
    /// afterwards and every following call fails.
    pub fn decode(&mut self) -> Result<Option<ServerOp>, DecoderError> {
        let result = self.decode_inner();
        if result.is_err() {
            self.state = State::Poisoned;
        }
        result
    }

    fn decode_inner(&mut self) -> Result<Option<ServerOp>, DecoderError> {
        loop {
            match &mut self.state {
                State::ControlLine { scanned } => {
                    // The `\r` may have been the last byte of the previous scan
                    let from = scanned.saturating_sub(1);
                    let Some(end) = memchr::memmem::find(&self.buf[from..], b"\r\n") else {
                        if self.buf.len() > MAX_CONTROL_LINE_LEN {
                            return Err(DecoderError::ControlLineTooLong {
                                len: self.buf.len(),
                            });
                        }
                        *scanned = self.buf.len();
                        return Ok(None);
                    };

                    let line_len = from + end;
                    let mut line = self.buf.split_to(line_len + "\r\n".len()).freeze();
                    line.truncate(line_len);
                    self.state = State::ControlLine { scanned: 0 };

                    match parse_control_line(&line)? {
                        ControlLine::Op(op) => return Ok(Some(op)),
                        ControlLine::Message(pending) => self.state = State::Body(pending),
                    }
                }
                State::Body(pending) => {
                    let frame_len = pending
                        .total_len
                        .checked_add("\r\n".len())
                        .ok_or(DecoderError::MessageTooLong {
                            len: pending.total_len,
                        })?;
                    if self.buf.len() < frame_len {
                        self.buf.reserve(frame_len - self.buf.len());
                        return Ok(None);
                    }

                    let State::Body(pending) =
                        mem::replace(&mut self.state, State::ControlLine { scanned: 0 })
                    else {
                        unreachable!()
                    };
                    let mut frame = self.buf.split_to(frame_len).freeze();
                    if !frame.ends_with(b"\r\n") {
                        return Err(DecoderError::MissingPayloadTerminator);
                    }
                    frame.truncate(pending.total_len);
                    let header_block = frame.split_to(pending.header_len);

                    let (status_code, headers) = if header_block.is_empty() {
                        (None, HeaderMap::new())
                    } else {
                        decode_header_block(&header_block)?
                    };

                    let PendingMessage {
                        subscription_id,
                        subject,
                        reply_subject,
                        ..
                    } = *pending;
                    return Ok(Some(ServerOp::Message {
                        message: ServerMessage {
                            status_code,
                            subscription_id,
                            base: MessageBase {
                                subject,
                                reply_subject,
                                headers,
                                payload: frame,
                            },
                        },
                    }));
                }
                State::Poisoned => return Err(DecoderError::Poisoned),
            }
        }
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_control_line(line: &Bytes) -> Result<ControlLine, DecoderError> {
    let verb_len = line
        .iter()
        .position(|&b| b == b' ' || b == b'\t')
        .unwrap_or(line.len());
    let (verb, rest) = line.split_at(verb_len);
    let is = |expected: &str| verb.eq_ignore_ascii_case(expected.as_bytes());

    let op = if is("MSG") {
        return parse_msg_args(line, rest, false).map(ControlLine::Message);
    } else if is("HMSG") {
        return parse_msg_args(line, rest, true).map(ControlLine::Message);
    } else if is("PING") {
        ServerOp::Ping
    } else if is("PONG") {
        ServerOp::Pong
    } else if is("+OK") {
        ServerOp::Success
    } else if is("-ERR") {
        let message = rest.trim_ascii();
        let message = message
            .strip_prefix(b"'")
            .and_then(|m| m.strip_suffix(b"'"))
            .unwrap_or(message);
        let message = ByteString::try_from(line.slice_ref(message))
            .map_err(|_| DecoderError::InvalidErrorMessage)?;
        ServerOp::Error {
            error: ServerError::parse(message),
        }
    } else if is("INFO") {
        let info = serde_json::from_slice(rest).map_err(DecoderError::InvalidInfo)?;
        ServerOp::Info { info }
    } else {
        return Err(DecoderError::UnknownOperation);
    };
    Ok(ControlLine::Op(op))
}

fn parse_msg_args(
    line: &Bytes,
    args: &[u8],
    has_headers: bool,
) -> Result<Box<PendingMessage>, DecoderError> {
    let mut parts = [&[][..]; 5];
    let mut count = 0;
    for arg in util::split_args(args) {
        if count == parts.len() {
            return Err(DecoderError::InvalidArgsCount);
        }
        parts[count] = arg;
        count += 1;
    }

    let (subject, sid, reply, sizes) = match (has_headers, count) {
        (false, 3) | (true, 4) => (parts[0], parts[1], None, &parts[2..count]),
        (false, 4) | (true, 5) => (parts[0], parts[1], Some(parts[2]), &parts[3..count]),
        _ => return Err(DecoderError::InvalidArgsCount),
    };

    let subject = subject_from(line, subject)?;
    let reply_subject = reply.map(|reply| subject_from(line, reply)).transpose()?;
    let subscription_id =
        SubscriptionId::from_ascii_bytes(sid).map_err(DecoderError::SubscriptionId)?;

    let (header_len, total_len) = if has_headers {
        let header_len = util::parse_usize(sizes[0]).map_err(DecoderError::InvalidLength)?;
        let total_len = util::parse_usize(sizes[1]).map_err(DecoderError::InvalidLength)?;
        if header_len > total_len {
            return Err(DecoderError::HeaderLongerThanTotal);
        }
        (header_len, total_len)
    } else {
        (
            0,
            util::parse_usize(sizes[0]).map_err(DecoderError::InvalidLength)?,
        )
    };

    if total_len > MAX_MESSAGE_LEN {
        return Err(DecoderError::MessageTooLong { len: total_len });
    }

    Ok(Box::new(PendingMessage {
        subscription_id,
        subject,
        reply_subject,
        header_len,
        total_len,
    }))
}

fn subject_from(line: &Bytes, raw: &[u8]) -> Result<Subject, DecoderError> {
    ByteString::try_from(line.slice_ref(raw))
        .map(Subject::from_dangerous_value)
        .map_err(|_| DecoderError::SubjectInvalidUtf8)
}

/// Decodes a standalone `NATS/1.0` header block
///
/// Jetstream returns stored headers in this form when a message is fetched
/// through its JSON API.
///
/// # Errors
///
/// Returns an error if the block is malformed.
pub fn decode_header_block(
    block: &Bytes,
) -> Result<(Option<StatusCode>, HeaderMap), DecoderError> {
    let mut lines = util::crlf_lines(block);
    let version_line = lines.next().unwrap_or_default();
    let status = version_line
        .strip_prefix(b"NATS/1.0")
        .ok_or(DecoderError::InvalidHeaderVersion)?
        .trim_ascii();

    let mut headers = HeaderMap::new();
    let status_code = if status.is_empty() {
        None
    } else {
        let (code, description) = status.split_at(status.len().min(3));
        let code = StatusCode::from_ascii_bytes(code).map_err(DecoderError::StatusCode)?;
        let description = description.trim_ascii();
        if !description.is_empty() {
            if let Ok(description) = ByteString::try_from(block.slice_ref(description)) {
                if let Ok(value) = HeaderValue::try_from(description) {
                    headers.append(HeaderName::DESCRIPTION, value);
                }
            }
        }
        Some(code)
    };

    for line in lines.filter(|line| !line.is_empty()) {
        let colon = memchr::memchr(b':', line).ok_or(DecoderError::InvalidHeaderLine)?;
        let name = line[..colon].trim_ascii();
        let value = line[colon + 1..].trim_ascii();

        let name = ByteString::try_from(block.slice_ref(name))
            .map_err(|_| DecoderError::HeaderInvalidUtf8)?;
        let name = HeaderName::try_from(name).map_err(DecoderError::HeaderName)?;
        if value.is_empty() {
            continue;
        }
        let value = ByteString::try_from(block.slice_ref(value))
            .map_err(|_| DecoderError::HeaderInvalidUtf8)?;
        let value = HeaderValue::try_from(value).map_err(DecoderError::HeaderValue)?;
        headers.append(name, value);
    }

    Ok((status_code, headers))
}

/// An error encountered while decoding the server byte stream
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    #[error("control line is longer than {MAX_CONTROL_LINE_LEN} bytes (got {len})")]
    ControlLineTooLong { len: usize },
    #[error("unknown server operation")]
    UnknownOperation,
    #[error("MSG or HMSG has an unexpected number of arguments")]
    InvalidArgsCount,
    #[error("subject is not valid utf-8")]
    SubjectInvalidUtf8,
    #[error("invalid subscription id")]
    SubscriptionId(#[source] ParseUintError),
    #[error("invalid message length")]
    InvalidLength(#[source] ParseUintError),
    #[error("message is longer than {MAX_MESSAGE_LEN} bytes (got {len})")]
    MessageTooLong { len: usize },
    #[error("header length is greater than the total length")]
    HeaderLongerThanTotal,
    #[error("message payload is not followed by CRLF")]
    MissingPayloadTerminator,
    #[error("header block doesn't start with NATS/1.0")]
    InvalidHeaderVersion,
    #[error("invalid status code")]
    StatusCode(#[source] StatusCodeError),
    #[error("header line has no ':'")]
    InvalidHeaderLine,
    #[error("header is not valid utf-8")]
    HeaderInvalidUtf8,
    #[error("invalid header name")]
    HeaderName(#[source] HeaderNameValidateError),
    #[error("invalid header value")]
    HeaderValue(#[source] HeaderValueValidateError),
    #[error("INFO payload couldn't be deserialized")]
    InvalidInfo(#[source] serde_json::Error),
    #[error("-ERR message is not valid utf-8")]
    InvalidErrorMessage,
    #[error("decoder was poisoned by a previous error")]
    Poisoned,
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut as _, Bytes};
    use claims::{assert_err, assert_matches, assert_ok, assert_ok_eq, assert_some};

    use super::{DecoderError, StreamDecoder};
    use crate::{
        error::ServerError,
        headers::{HeaderMap, HeaderName},
        proto::ServerOp,
        MessageBase, ServerMessage, StatusCode, Subject,
    };

    fn feed(decoder: &mut StreamDecoder, bytes: &'static [u8]) {
        decoder.read_buf().put_slice(bytes);
    }

    #[test]
    fn control_operations() {
        let mut decoder = StreamDecoder::new();
        feed(
            &mut decoder,
            b"PING\r\nPONG\r\n+OK\r\n-ERR 'Authorization Violation'\r\n",
        );
        assert_ok_eq!(decoder.decode(), Some(ServerOp::Ping));
        assert_ok_eq!(decoder.decode(), Some(ServerOp::Pong));
        assert_ok_eq!(decoder.decode(), Some(ServerOp::Success));
        assert_ok_eq!(
            decoder.decode(),
            Some(ServerOp::Error {
                error: ServerError::AuthorizationViolation
            })
        );
        assert_ok_eq!(decoder.decode(), None);
    }

    #[test]
    fn message_split_across_reads() {
        let mut decoder = StreamDecoder::new();
        feed(&mut decoder, b"MSG orders.new 7 _INBOX.x 5");
        assert_ok_eq!(decoder.decode(), None);
        feed(&mut decoder, b"\r");
        assert_ok_eq!(decoder.decode(), None);
        feed(&mut decoder, b"\nhel");
        assert_ok_eq!(decoder.decode(), None);
        feed(&mut decoder, b"lo\r\n");
        assert_ok_eq!(
            decoder.decode(),
            Some(ServerOp::Message {
                message: ServerMessage {
                    status_code: None,
                    subscription_id: 7.into(),
                    base: MessageBase {
                        subject: Subject::from_static("orders.new"),
                        reply_subject: Some(Subject::from_static("_INBOX.x")),
                        headers: HeaderMap::new(),
                        payload: Bytes::from_static(b"hello"),
                    },
                },
            })
        );
        assert_eq!(0, decoder.buffered());
    }

    #[test]
    fn payload_may_contain_crlf() {
        let mut decoder = StreamDecoder::new();
        feed(&mut decoder, b"MSG a 1 4\r\n\r\n\r\n\r\nPING\r\n");
        let op = assert_some!(assert_ok!(decoder.decode()));
        assert_matches!(op, ServerOp::Message { message } if message.base.payload == "\r\n\r\n");
        assert_ok_eq!(decoder.decode(), Some(ServerOp::Ping));
    }

    #[test]
    fn hmsg_with_headers() {
        let mut decoder = StreamDecoder::new();
        feed(
            &mut decoder,
            b"HMSG a.b 2 36 41\r\nNATS/1.0\r\nA: 1\r\nNats-Msg-Id: xyz\r\n\r\nhello\r\n",
        );
        let op = assert_some!(assert_ok!(decoder.decode()));
        let ServerOp::Message { message } = op else {
            panic!("expected a message, got {op:?}");
        };
        assert_eq!(None, message.status_code);
        assert_eq!(2, message.base.headers.len());
        assert_eq!(
            "xyz",
            message
                .base
                .headers
                .get(&HeaderName::MESSAGE_ID)
                .unwrap()
                .as_str()
        );
        assert_eq!(Bytes::from_static(b"hello"), message.base.payload);
    }

    #[test]
    fn no_responders_status() {
        let mut decoder = StreamDecoder::new();
        feed(
            &mut decoder,
            b"HMSG _INBOX.abc.1 1 16 16\r\nNATS/1.0 503\r\n\r\n\r\n",
        );
        let op = assert_some!(assert_ok!(decoder.decode()));
        let ServerOp::Message { message } = op else {
            panic!("expected a message, got {op:?}");
        };
        assert_eq!(Some(StatusCode::NO_RESPONDERS), message.status_code);
        assert!(message.is_no_responders());
    }

    #[test]
    fn status_with_description() {
        let mut decoder = StreamDecoder::new();
        feed(
            &mut decoder,
            b"HMSG a 1 32 32\r\nNATS/1.0 408 Request Timeout\r\n\r\n\r\n",
        );
        let op = assert_some!(assert_ok!(decoder.decode()));
        let ServerOp::Message { message } = op else {
            panic!("expected a message, got {op:?}");
        };
        assert_eq!(Some(StatusCode::TIMEOUT), message.status_code);
        assert_eq!(
            "Request Timeout",
            message
                .base
                .headers
                .get(&HeaderName::DESCRIPTION)
                .unwrap()
                .as_str()
        );
    }

    #[test]
    fn info() {
        let mut decoder = StreamDecoder::new();
        feed(
            &mut decoder,
            br#"INFO {"server_id":"x","max_payload":1024,"connect_urls":["127.0.0.1:4223"]}"#,
        );
        feed(&mut decoder, b"\r\n");
        let op = assert_some!(assert_ok!(decoder.decode()));
        let ServerOp::Info { info } = op else {
            panic!("expected INFO, got {op:?}");
        };
        assert_eq!("x", info.id);
        assert_eq!(1024, info.max_payload.get());
        assert_eq!(1, info.connect_urls.len());
    }

    #[test]
    fn malformed_input_poisons() {
        let mut decoder = StreamDecoder::new();
        feed(&mut decoder, b"BOGUS\r\nPING\r\n");
        assert_matches!(decoder.decode(), Err(DecoderError::UnknownOperation));
        assert_matches!(decoder.decode(), Err(DecoderError::Poisoned));
    }

    #[test]
    fn bad_msg_arguments() {
        let mut decoder = StreamDecoder::new();
        feed(&mut decoder, b"MSG a\r\n");
        assert_matches!(decoder.decode(), Err(DecoderError::InvalidArgsCount));

        let mut decoder = StreamDecoder::new();
        feed(&mut decoder, b"HMSG a 1 10 5\r\n");
        assert_matches!(decoder.decode(), Err(DecoderError::HeaderLongerThanTotal));

        let mut decoder = StreamDecoder::new();
        feed(&mut decoder, b"MSG a 1 2\r\nabcd\r\n");
        assert_err!(decoder.decode());
    }

    #[test]
    fn unterminated_control_line_limit() {
        let mut decoder = StreamDecoder::new();
        for _ in 0..(17 * 1024 / 16) {
            feed(&mut decoder, b"AAAAAAAAAAAAAAAA");
        }
        assert_matches!(
            decoder.decode(),
            Err(DecoderError::ControlLineTooLong { .. })
        );
    }

    #[test]
    fn oversized_message_length() {
        let mut decoder = StreamDecoder::new();
        feed(&mut decoder, b"MSG a 1 4611686018427387904\r\nxy");
        assert_matches!(
            decoder.decode(),
            Err(DecoderError::MessageTooLong {
                len: 4_611_686_018_427_387_904
            })
        );

        let mut decoder = StreamDecoder::new();
        feed(&mut decoder, b"HMSG a 1 12 18446744073709551615\r\n");
        assert_matches!(
            decoder.decode(),
            Err(DecoderError::MessageTooLong { .. })
        );

        let mut decoder = StreamDecoder::new();
        feed(&mut decoder, b"MSG a 1 67108865\r\n");
        assert_matches!(
            decoder.decode(),
            Err(DecoderError::MessageTooLong { len: 67_108_865 })
        );
    }
}
