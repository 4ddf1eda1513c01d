use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::messages::{self, Message};

/// Parser phases for the wire framing: optional whitespace, a fixed-width
/// ASCII hex length, optional whitespace, then the bencoded payload.
#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    SkipBefore,
    Len,
    SkipAfter,
    Payload,
}

/// Stream parser and frame builder for the peer wire protocol.
///
/// Handles partial reads: `Framed` keeps calling [`decode`] until it
/// returns `None`, so every complete message in the buffer is dispatched
/// before the connection returns to the loop. The codec also enforces the
/// handshake ordering rules, since "first message must be helo" and
/// "double handshake" are properties of the byte stream, not the session.
pub struct FrameCodec {
    len_bytes: usize,
    max_len: usize,
    state: State,
    need: usize,
    helo_seen: bool,
}

impl FrameCodec {
    pub fn new(len_bytes: usize, max_len: usize) -> Self {
        FrameCodec {
            len_bytes,
            max_len,
            state: State::SkipBefore,
            need: 0,
            helo_seen: false,
        }
    }
}

fn strip_leading_whitespace(src: &mut BytesMut) {
    let n = src
        .iter()
        .take_while(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
        .count();
    let _ = src.split_to(n);
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            match self.state {
                State::SkipBefore | State::SkipAfter => {
                    strip_leading_whitespace(src);
                    if src.is_empty() {
                        return Ok(None);
                    }
                    self.state = if self.state == State::SkipBefore {
                        State::Len
                    } else {
                        State::Payload
                    };
                }
                State::Len => {
                    if src.len() < self.len_bytes {
                        return Ok(None);
                    }
                    let raw = src.split_to(self.len_bytes);
                    let len = std::str::from_utf8(&raw)
                        .ok()
                        .and_then(|s| usize::from_str_radix(s, 16).ok())
                        .ok_or_else(|| {
                            Error::protocol(format!(
                                "could not decode length prefix: {:?}",
                                String::from_utf8_lossy(&raw)
                            ))
                        })?;

                    if len > self.max_len {
                        return Err(Error::protocol("message too long"));
                    }

                    self.need = len;
                    self.state = State::SkipAfter;
                }
                State::Payload => {
                    if src.len() < self.need {
                        return Ok(None);
                    }
                    let payload = src.split_to(self.need);
                    self.state = State::SkipBefore;

                    let msg = messages::decode(&payload)?;

                    match &msg {
                        Message::Helo(_) if self.helo_seen => {
                            return Err(Error::protocol("double handshake"));
                        }
                        Message::Helo(_) => self.helo_seen = true,
                        _ if !self.helo_seen => {
                            return Err(Error::protocol("first message must be helo"));
                        }
                        _ => {}
                    }

                    return Ok(Some(msg));
                }
            }
        }
    }
}

/// The write half carries pre-validated, pre-framed bytes produced by
/// [`frame`]; the codec just passes them through.
impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Validate, bencode, and frame one outgoing message. The space after the
/// length field and the trailing `\r\n` keep the stream greppable.
pub fn frame(msg: &Message, len_bytes: usize, max_len: usize) -> Result<Bytes> {
    let payload = messages::encode(msg)?;
    if payload.len() > max_len {
        return Err(Error::decoder(format!(
            "outgoing {} payload of {} bytes exceeds limit",
            msg.name(),
            payload.len()
        )));
    }

    let mut out = format!("{:0width$x} ", payload.len(), width = len_bytes).into_bytes();
    out.extend_from_slice(&payload);
    out.extend_from_slice(b"\r\n");
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Helo;

    fn helo() -> Message {
        Message::Helo(Helo {
            peerid: "alice-x".to_string(),
            swarmid: "a".repeat(40),
            port: 7001,
            client: "mainline-0.1".to_string(),
        })
    }

    fn drain(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(msg) = codec.decode(buf).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn frame_format() {
        let wire = frame(&Message::Ping, 4, 16 * 1024).unwrap();
        // "000d d3:msg4:pinge\r\n"
        assert!(wire.starts_with(b"000d "));
        assert!(wire.ends_with(b"\r\n"));
    }

    #[test]
    fn two_messages_in_one_read() {
        let mut codec = FrameCodec::new(4, 16 * 1024);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame(&helo(), 4, 16 * 1024).unwrap());
        buf.extend_from_slice(&frame(&Message::Ping, 4, 16 * 1024).unwrap());

        let msgs = drain(&mut codec, &mut buf);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1], Message::Ping);
        assert!(buf.is_empty());
    }

    #[test]
    fn byte_at_a_time() {
        let mut codec = FrameCodec::new(4, 16 * 1024);
        let mut buf = BytesMut::new();
        let wire = frame(&helo(), 4, 16 * 1024).unwrap();

        let mut seen = Vec::new();
        for b in wire.iter() {
            buf.extend_from_slice(&[*b]);
            seen.extend(drain(&mut codec, &mut buf));
        }
        assert_eq!(seen, vec![helo()]);
    }

    #[test]
    fn interleaved_whitespace_tolerated() {
        let mut codec = FrameCodec::new(4, 16 * 1024);
        let mut buf = BytesMut::new();
        let payload = crate::messages::encode(&helo()).unwrap();
        buf.extend_from_slice(b"  \r\n");
        buf.extend_from_slice(format!("{:04x}", payload.len()).as_bytes());
        buf.extend_from_slice(b" \t ");
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(b"\r\n\r\n");

        assert_eq!(drain(&mut codec, &mut buf), vec![helo()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn bad_length_prefix_is_protocol_error() {
        let mut codec = FrameCodec::new(4, 16 * 1024);
        let mut buf = BytesMut::from(&b"zzzz d4:pinge"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn length_limit_boundary() {
        let wire = frame(&helo(), 4, 16 * 1024).unwrap();
        let payload_len = {
            let s = std::str::from_utf8(&wire[..4]).unwrap();
            usize::from_str_radix(s, 16).unwrap()
        };

        // A limit of exactly the payload length is accepted.
        let mut codec = FrameCodec::new(4, payload_len);
        let mut buf = BytesMut::from(&wire[..]);
        assert_eq!(drain(&mut codec, &mut buf), vec![helo()]);

        // One byte less terminates the session.
        let mut codec = FrameCodec::new(4, payload_len - 1);
        let mut buf = BytesMut::from(&wire[..]);
        match codec.decode(&mut buf) {
            Err(Error::Protocol(reason)) => assert_eq!(reason, "message too long"),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn first_message_must_be_helo() {
        let mut codec = FrameCodec::new(4, 16 * 1024);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame(&Message::Ping, 4, 16 * 1024).unwrap());
        assert!(matches!(codec.decode(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn double_handshake_rejected() {
        let mut codec = FrameCodec::new(4, 16 * 1024);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame(&helo(), 4, 16 * 1024).unwrap());
        buf.extend_from_slice(&frame(&helo(), 4, 16 * 1024).unwrap());

        assert!(codec.decode(&mut buf).unwrap().is_some());
        match codec.decode(&mut buf) {
            Err(Error::Protocol(reason)) => assert_eq!(reason, "double handshake"),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }
}
