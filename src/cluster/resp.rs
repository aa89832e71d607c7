//! RESP2 wire model: commands out, replies in.
//!
//! Commands are encoded as arrays of bulk strings; replies are decoded
//! into [`Value`]. The codec is incremental: a partial frame leaves the
//! buffer untouched and yields `None`.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::Error;

/// A command and its arguments, ready to encode.
#[derive(Debug, Clone)]
pub struct Command {
    parts: Vec<Bytes>,
}

impl Command {
    /// Start a command with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            parts: vec![Bytes::copy_from_slice(name.as_bytes())],
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.parts.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// The command name.
    pub fn name(&self) -> &[u8] {
        &self.parts[0]
    }

    /// The routing key: the first argument, when present.
    pub(crate) fn key(&self) -> Option<&[u8]> {
        self.parts.get(1).map(|b| b.as_ref())
    }
}

/// A decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Simple string reply (`+OK`).
    Simple(String),
    /// Error reply (`-ERR ...`), not yet classified.
    Error(String),
    /// Integer reply.
    Int(i64),
    /// Bulk string reply.
    Bulk(Bytes),
    /// Null bulk or null array reply.
    Nil,
    /// Array reply.
    Array(Vec<Value>),
}

impl Value {
    /// Turn an error reply into a typed [`Error`], passing other replies
    /// through. MOVED and ASK replies become their dedicated variants so
    /// callers can follow the redirection.
    pub fn into_result(self) -> Result<Value, Error> {
        match self {
            Value::Error(msg) => Err(parse_reply_error(&msg)),
            v => Ok(v),
        }
    }

    /// Whether this is a null reply.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Integer content of the reply, when it has one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Bulk (or simple) string content of the reply.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Value::Bulk(b) => Some(b),
            Value::Simple(s) => Some(Bytes::from(s)),
            _ => None,
        }
    }

    /// Array content of the reply.
    pub fn into_array(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// Classify a `-...` reply line.
fn parse_reply_error(msg: &str) -> Error {
    let mut fields = msg.split_whitespace();
    match fields.next() {
        Some(kind @ ("MOVED" | "ASK")) => {
            let slot = fields.next().and_then(|s| s.parse::<u16>().ok());
            let addr = fields.next().map(str::to_owned);
            match (slot, addr) {
                (Some(slot), Some(addr)) if kind == "MOVED" => Error::Moved { slot, addr },
                (Some(slot), Some(addr)) => Error::Ask { slot, addr },
                _ => Error::Reply(msg.to_owned()),
            }
        }
        _ => Error::Reply(msg.to_owned()),
    }
}

/// Codec for one upstream node connection.
#[derive(Debug, Default)]
pub struct RespCodec;

impl Encoder<Command> for RespCodec {
    type Error = Error;

    fn encode(&mut self, cmd: Command, dst: &mut BytesMut) -> Result<(), Error> {
        dst.reserve(16 + cmd.parts.iter().map(|p| p.len() + 16).sum::<usize>());
        dst.put_slice(format!("*{}\r\n", cmd.parts.len()).as_bytes());
        for part in &cmd.parts {
            dst.put_slice(format!("${}\r\n", part.len()).as_bytes());
            dst.put_slice(part);
            dst.put_slice(b"\r\n");
        }
        Ok(())
    }
}

impl Decoder for RespCodec {
    type Item = Value;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, Error> {
        match parse_value(src)? {
            Some((value, consumed)) => {
                let _ = src.split_to(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

/// Read a CRLF-terminated line starting at `buf[0]`, returning the line
/// content and the offset just past the terminator.
fn read_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    Some((&buf[..pos], pos + 2))
}

fn parse_int(line: &[u8]) -> Result<i64, Error> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Protocol("invalid integer in reply".into()))
}

/// Parse one complete value from the head of `buf`. Returns `None` when
/// the buffer does not yet hold a full frame.
fn parse_value(buf: &[u8]) -> Result<Option<(Value, usize)>, Error> {
    let Some((&marker, rest)) = buf.split_first() else {
        return Ok(None);
    };
    let Some((line, line_len)) = read_line(rest) else {
        return Ok(None);
    };
    let header = 1 + line_len;

    match marker {
        b'+' => Ok(Some((
            Value::Simple(String::from_utf8_lossy(line).into_owned()),
            header,
        ))),
        b'-' => Ok(Some((
            Value::Error(String::from_utf8_lossy(line).into_owned()),
            header,
        ))),
        b':' => Ok(Some((Value::Int(parse_int(line)?), header))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((Value::Nil, header)));
            }
            let len = len as usize;
            let body = &buf[header..];
            if body.len() < len + 2 {
                return Ok(None);
            }
            if &body[len..len + 2] != b"\r\n" {
                return Err(Error::Protocol("bulk string missing terminator".into()));
            }
            Ok(Some((
                Value::Bulk(Bytes::copy_from_slice(&body[..len])),
                header + len + 2,
            )))
        }
        b'*' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((Value::Nil, header)));
            }
            let mut items = Vec::with_capacity(len as usize);
            let mut offset = header;
            for _ in 0..len {
                match parse_value(&buf[offset..])? {
                    Some((item, consumed)) => {
                        items.push(item);
                        offset += consumed;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Value::Array(items), offset)))
        }
        other => Err(Error::Protocol(format!(
            "unexpected reply marker 0x{other:02x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> (Vec<Value>, usize) {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(v) = codec.decode(&mut buf).unwrap() {
            out.push(v);
        }
        (out, buf.len())
    }

    #[test]
    fn encode_command() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Command::new("LPUSH").arg("k").arg("v1"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"*3\r\n$5\r\nLPUSH\r\n$1\r\nk\r\n$2\r\nv1\r\n");
    }

    #[test]
    fn decode_scalars() {
        let (values, rest) = decode_all(b"+OK\r\n:42\r\n$3\r\nfoo\r\n$-1\r\n");
        assert_eq!(
            values,
            vec![
                Value::Simple("OK".into()),
                Value::Int(42),
                Value::Bulk(Bytes::from_static(b"foo")),
                Value::Nil,
            ]
        );
        assert_eq!(rest, 0);
    }

    #[test]
    fn decode_array() {
        let (values, _) = decode_all(b"*2\r\n$1\r\nk\r\n$5\r\nhello\r\n");
        assert_eq!(
            values,
            vec![Value::Array(vec![
                Value::Bulk(Bytes::from_static(b"k")),
                Value::Bulk(Bytes::from_static(b"hello")),
            ])]
        );
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"$5\r\nhel"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 7);
        buf.extend_from_slice(b"lo\r\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Value::Bulk(Bytes::from_static(b"hello")))
        );
    }

    #[test]
    fn redirections_are_typed() {
        let moved = Value::Error("MOVED 3999 127.0.0.1:6381".into()).into_result();
        assert!(matches!(
            moved,
            Err(Error::Moved { slot: 3999, ref addr }) if addr == "127.0.0.1:6381"
        ));

        let ask = Value::Error("ASK 866 127.0.0.1:6380".into()).into_result();
        assert!(matches!(
            ask,
            Err(Error::Ask { slot: 866, ref addr }) if addr == "127.0.0.1:6380"
        ));

        let plain = Value::Error("ERR wrong number of arguments".into()).into_result();
        assert!(matches!(plain, Err(Error::Reply(_))));
    }
}
