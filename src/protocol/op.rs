use bytes::{Bytes, BytesMut};
use serde_json as json;

use super::client::*;
use super::headers::HeaderMap;
use super::server::*;
use super::{Command, CommandError};

/// Longest accepted control line; a line that long without a CRLF means the
/// peer is not speaking the protocol.
const MAX_CONTROL_LINE: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// [SERVER] Sent to client after initial TCP/IP connection and on cluster changes
    INFO(ServerInfo),
    /// [CLIENT] Sent to server to specify connection information
    CONNECT(ConnectCommand),
    /// [CLIENT] Publish a message to a subject, with optional reply subject and headers
    PUB(PubCommand),
    /// [CLIENT] Subscribe to a subject (or subject wildcard)
    SUB(SubCommand),
    /// [CLIENT] Unsubscribe (or auto-unsubscribe) from subject
    UNSUB(UnsubCommand),
    /// [SERVER] Delivers a message payload to a subscriber
    MSG(Message),
    /// [BOTH] PING keep-alive message
    PING,
    /// [BOTH] PONG keep-alive message
    PONG,
    /// [SERVER] Acknowledges well-formed protocol message in `verbose` mode
    OK,
    /// [SERVER] Indicates a protocol error. May cause client disconnect.
    ERR(ServerError),
}

/// Control-line book-keeping carried between decoder polls while the
/// payload of a `PUB`/`HPUB`/`MSG`/`HMSG` frame is still in flight.
#[derive(Debug)]
pub struct PendingPayload {
    kind: PayloadKind,
    subject: String,
    sid: u64,
    reply_to: Option<String>,
    header_len: usize,
    total_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PayloadKind {
    Pub,
    Msg,
}

impl Op {
    /// Wire encoding of the op.
    pub fn into_bytes(self) -> Result<Bytes, CommandError> {
        match self {
            Op::INFO(cmd) => cmd.into_vec(),
            Op::CONNECT(cmd) => cmd.into_vec(),
            Op::PUB(cmd) => cmd.into_vec(),
            Op::SUB(cmd) => cmd.into_vec(),
            Op::UNSUB(cmd) => cmd.into_vec(),
            Op::MSG(msg) => msg.into_vec(),
            Op::PING => Ok(Bytes::from_static(b"PING\r\n")),
            Op::PONG => Ok(Bytes::from_static(b"PONG\r\n")),
            Op::OK => Ok(Bytes::from_static(b"+OK\r\n")),
            Op::ERR(e) => Ok(format!("-ERR '{}'\r\n", e).as_bytes().into()),
        }
    }

    /// Approximate wire size, used by the outbound queue for flow
    /// accounting without encoding twice.
    pub fn encoded_len(&self) -> usize {
        match *self {
            Op::PING | Op::PONG => 6,
            Op::OK => 5,
            Op::ERR(ref e) => e.reason().len() + 9,
            Op::INFO(_) | Op::CONNECT(_) => 256,
            Op::PUB(ref cmd) => {
                cmd.subject.len()
                    + cmd.reply_to.as_ref().map(|r| r.len() + 1).unwrap_or(0)
                    + cmd.headers.as_ref().map(|h| h.encoded_len()).unwrap_or(0)
                    + cmd.payload.len()
                    + 32
            }
            Op::MSG(ref msg) => {
                msg.subject.len()
                    + msg.reply_to.as_ref().map(|r| r.len() + 1).unwrap_or(0)
                    + msg.headers.as_ref().map(|h| h.encoded_len()).unwrap_or(0)
                    + msg.payload.len()
                    + 40
            }
            Op::SUB(ref cmd) => {
                cmd.subject.len()
                    + cmd.queue_group.as_ref().map(|q| q.len() + 1).unwrap_or(0)
                    + 28
            }
            Op::UNSUB(_) => 32,
        }
    }

    /// One decoder step: consumes at most one complete frame from `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. `pending` carries the
    /// already-parsed control line of a frame whose payload has not fully
    /// arrived, so the transport can fragment anywhere. Payload bytes are
    /// sliced out of `buf` exactly once.
    pub fn poll_from(
        buf: &mut BytesMut,
        pending: &mut Option<PendingPayload>,
    ) -> Result<Option<Op>, CommandError> {
        loop {
            if let Some(p) = pending.take() {
                if buf.len() < p.total_len + 2 {
                    *pending = Some(p);
                    return Ok(None);
                }

                let mut body = buf.split_to(p.total_len + 2);
                if &body[p.total_len..] != b"\r\n" {
                    return Err(CommandError::CommandMalformed);
                }
                body.truncate(p.total_len);
                let body = body.freeze();

                let (headers, status, payload) = if p.header_len > 0 {
                    if p.header_len > body.len() {
                        return Err(CommandError::CommandMalformed);
                    }
                    let (map, status) = HeaderMap::decode(&body.slice_to(p.header_len))?;
                    (Some(map), status, body.slice_from(p.header_len))
                } else {
                    (None, None, body)
                };

                let op = match p.kind {
                    PayloadKind::Msg => Op::MSG(Message {
                        subject: p.subject,
                        sid: p.sid,
                        reply_to: p.reply_to,
                        headers,
                        status,
                        payload,
                    }),
                    PayloadKind::Pub => Op::PUB(PubCommand {
                        subject: p.subject,
                        reply_to: p.reply_to,
                        headers,
                        payload,
                    }),
                };

                return Ok(Some(op));
            }

            let line_end = match buf.windows(2).position(|w| w == b"\r\n") {
                Some(pos) => pos,
                None => {
                    if buf.len() > MAX_CONTROL_LINE {
                        return Err(CommandError::CommandMalformed);
                    }
                    return Ok(None);
                }
            };

            let line = buf.split_to(line_end + 2);
            match Op::parse_control_line(&line[..line_end], pending)? {
                Some(op) => return Ok(Some(op)),
                // A payload-carrying control line landed in `pending`; loop
                // to see whether the payload is already buffered.
                None => continue,
            }
        }
    }

    fn parse_control_line(
        line: &[u8],
        pending: &mut Option<PendingPayload>,
    ) -> Result<Option<Op>, CommandError> {
        let text = ::std::str::from_utf8(line)?;
        let mut split = text.splitn(2, |c: char| c == ' ' || c == '\t');
        // splitn always yields at least one element
        let verb = split.next().unwrap();
        let rest = split.next().unwrap_or("").trim();

        if verb.eq_ignore_ascii_case("PING") {
            return Ok(Some(Op::PING));
        } else if verb.eq_ignore_ascii_case("PONG") {
            return Ok(Some(Op::PONG));
        } else if verb == "+OK" {
            return Ok(Some(Op::OK));
        } else if verb.eq_ignore_ascii_case("-ERR") {
            return Ok(Some(Op::ERR(ServerError::parse(rest))));
        } else if verb.eq_ignore_ascii_case("INFO") {
            return Ok(Some(Op::INFO(json::from_str(rest)?)));
        } else if verb.eq_ignore_ascii_case("CONNECT") {
            return Ok(Some(Op::CONNECT(json::from_str(rest)?)));
        }

        let args: Vec<&str> = rest.split_whitespace().collect();

        if verb.eq_ignore_ascii_case("MSG") {
            let (subject, sid, reply_to, len) = match args[..] {
                [subject, sid, len] => (subject, sid, None, len),
                [subject, sid, reply_to, len] => (subject, sid, Some(reply_to), len),
                _ => return Err(CommandError::CommandMalformed),
            };
            *pending = Some(PendingPayload {
                kind: PayloadKind::Msg,
                subject: subject.into(),
                sid: sid.parse()?,
                reply_to: reply_to.map(String::from),
                header_len: 0,
                total_len: len.parse()?,
            });
        } else if verb.eq_ignore_ascii_case("HMSG") {
            let (subject, sid, reply_to, header_len, total_len) = match args[..] {
                [subject, sid, hdr, total] => (subject, sid, None, hdr, total),
                [subject, sid, reply_to, hdr, total] => (subject, sid, Some(reply_to), hdr, total),
                _ => return Err(CommandError::CommandMalformed),
            };
            let header_len: usize = header_len.parse()?;
            let total_len: usize = total_len.parse()?;
            if header_len > total_len {
                return Err(CommandError::CommandMalformed);
            }
            *pending = Some(PendingPayload {
                kind: PayloadKind::Msg,
                subject: subject.into(),
                sid: sid.parse()?,
                reply_to: reply_to.map(String::from),
                header_len,
                total_len,
            });
        } else if verb.eq_ignore_ascii_case("PUB") {
            let (subject, reply_to, len) = match args[..] {
                [subject, len] => (subject, None, len),
                [subject, reply_to, len] => (subject, Some(reply_to), len),
                _ => return Err(CommandError::CommandMalformed),
            };
            *pending = Some(PendingPayload {
                kind: PayloadKind::Pub,
                subject: subject.into(),
                sid: 0,
                reply_to: reply_to.map(String::from),
                header_len: 0,
                total_len: len.parse()?,
            });
        } else if verb.eq_ignore_ascii_case("HPUB") {
            let (subject, reply_to, header_len, total_len) = match args[..] {
                [subject, hdr, total] => (subject, None, hdr, total),
                [subject, reply_to, hdr, total] => (subject, Some(reply_to), hdr, total),
                _ => return Err(CommandError::CommandMalformed),
            };
            let header_len: usize = header_len.parse()?;
            let total_len: usize = total_len.parse()?;
            if header_len > total_len {
                return Err(CommandError::CommandMalformed);
            }
            *pending = Some(PendingPayload {
                kind: PayloadKind::Pub,
                subject: subject.into(),
                sid: 0,
                reply_to: reply_to.map(String::from),
                header_len,
                total_len,
            });
        } else if verb.eq_ignore_ascii_case("SUB") {
            let (subject, queue_group, sid) = match args[..] {
                [subject, sid] => (subject, None, sid),
                [subject, queue_group, sid] => (subject, Some(queue_group), sid),
                _ => return Err(CommandError::CommandMalformed),
            };
            return Ok(Some(Op::SUB(SubCommand {
                subject: subject.into(),
                queue_group: queue_group.map(String::from),
                sid: sid.parse()?,
            })));
        } else if verb.eq_ignore_ascii_case("UNSUB") {
            let (sid, max_msgs) = match args[..] {
                [sid] => (sid, None),
                [sid, max] => (sid, Some(max)),
                _ => return Err(CommandError::CommandMalformed),
            };
            let max_msgs = match max_msgs {
                Some(max) => Some(max.parse()?),
                None => None,
            };
            return Ok(Some(Op::UNSUB(UnsubCommand {
                sid: sid.parse()?,
                max_msgs,
            })));
        } else {
            return Err(CommandError::CommandNotFoundOrSupported);
        }

        Ok(None)
    }

    /// Parses one complete buffered frame, for callers that already hold
    /// the whole thing (tests, benches, mock servers).
    pub fn try_parse_frame(buf: &[u8]) -> Result<Op, CommandError> {
        let mut bytes = BytesMut::from(buf);
        let mut pending = None;
        match Op::poll_from(&mut bytes, &mut pending)? {
            Some(op) => Ok(op),
            None => Err(CommandError::IncompleteCommandError),
        }
    }
}
