//! RESP `Decoder`/`Encoder` pair (C2, §4.2), composing over [`Framer`] so it
//! plugs into `tokio_util::codec::Framed` for either a TCP or Unix-domain
//! transport.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::RedisError;
use crate::resp::cmd::Cmd;
use crate::resp::framer::{Frame, Framer};
use crate::resp::value::{decode_bulk, encoding::Charset, error_from_line, invalid_response, Value};

/// One level of in-progress multi-bulk assembly (§4.2 "Multi-bulk assembly").
struct PartialArray {
    remaining: usize,
    items: Vec<Value>,
}

pub struct RespCodec {
    framer: Framer,
    stack: Vec<PartialArray>,
    charset: Option<&'static Charset>,
    convert_numbers: bool,
}

impl RespCodec {
    pub fn new(charset: Option<&'static Charset>, convert_numbers: bool) -> Self {
        RespCodec { framer: Framer::new(), stack: Vec::new(), charset, convert_numbers }
    }

    /// Folds a freshly completed value into the innermost open array, or
    /// returns it as the finished top-level reply if there is no array in
    /// progress. Recurses when folding the value closes out its parent.
    fn complete_value(&mut self, value: Value) -> Option<Value> {
        match self.stack.last_mut() {
            None => Some(value),
            Some(top) => {
                top.items.push(value);
                if top.items.len() == top.remaining {
                    let finished = self.stack.pop().unwrap();
                    self.complete_value(Value::Array(finished.items))
                } else {
                    None
                }
            }
        }
    }

    fn handle_line(&mut self, line: Vec<u8>) -> Result<Option<Value>, RedisError> {
        if line.is_empty() {
            return Err(invalid_response("empty reply line"));
        }
        let (tag, rest) = (line[0], &line[1..]);
        let text = std::str::from_utf8(rest).map_err(|_| invalid_response("non-utf8 reply header"))?;
        match tag {
            b'+' => Ok(self.complete_value(Value::Status(text.to_string()))),
            b'-' => Ok(self.complete_value(Value::Error(error_from_line(text)))),
            b':' => {
                let n: i64 = text
                    .parse()
                    .map_err(|_| invalid_response(format!("bad integer reply '{text}'")))?;
                Ok(self.complete_value(Value::Int(n)))
            }
            b'$' => {
                let len: i64 = text
                    .parse()
                    .map_err(|_| invalid_response(format!("bad bulk length '{text}'")))?;
                if len < 0 {
                    Ok(self.complete_value(Value::Nil))
                } else {
                    self.framer.set_line_mode(len as usize + 2);
                    Ok(None)
                }
            }
            b'*' => {
                let count: i64 = text
                    .parse()
                    .map_err(|_| invalid_response(format!("bad multi-bulk count '{text}'")))?;
                if count < 0 {
                    Ok(self.complete_value(Value::Nil))
                } else if count == 0 {
                    Ok(self.complete_value(Value::Array(Vec::new())))
                } else {
                    self.stack.push(PartialArray { remaining: count as usize, items: Vec::with_capacity(count as usize) });
                    Ok(None)
                }
            }
            other => Err(invalid_response(format!("unknown reply type byte '{}'", other as char))),
        }
    }

    fn handle_raw(&mut self, mut raw: Vec<u8>) -> Result<Option<Value>, RedisError> {
        // strip the trailing \r\n that set_line_mode's "+2" included.
        raw.truncate(raw.len().saturating_sub(2));
        let value = decode_bulk(raw, self.charset, self.convert_numbers);
        Ok(self.complete_value(value))
    }
}

impl Decoder for RespCodec {
    type Item = Value;
    type Error = RedisError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, RedisError> {
        loop {
            let frame = match self.framer.next_frame(src)? {
                None => return Ok(None),
                Some(f) => f,
            };
            let completed = match frame {
                Frame::Line(line) => self.handle_line(line)?,
                Frame::Raw(raw) => self.handle_raw(raw)?,
            };
            if let Some(value) = completed {
                return Ok(Some(value));
            }
            // otherwise a nested array is still open or a bulk payload is
            // still pending; loop to pull the next frame out of `src`.
        }
    }
}

impl Encoder<&Cmd> for RespCodec {
    type Error = RedisError;

    fn encode(&mut self, cmd: &Cmd, dst: &mut BytesMut) -> Result<(), RedisError> {
        let args = cmd.packed_args();
        dst.reserve(cmd.encoded_len_hint());
        dst.put_slice(format!("*{}\r\n", args.len()).as_bytes());
        for arg in args {
            dst.put_slice(format!("${}\r\n", arg.len()).as_bytes());
            dst.put_slice(arg);
            dst.put_slice(b"\r\n");
        }
        Ok(())
    }
}

impl Encoder<&[u8]> for RespCodec {
    type Error = RedisError;

    /// Writes an already fully RESP-encoded byte string (used for pipelines,
    /// where `Cmd::packed_command` bytes for several commands are
    /// concatenated once before a single transport write, §4.6).
    fn encode(&mut self, packed: &[u8], dst: &mut BytesMut) -> Result<(), RedisError> {
        dst.extend_from_slice(packed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::value::encoding::UTF8;

    fn decode_all(bytes: &[u8]) -> Vec<Value> {
        let mut codec = RespCodec::new(Some(&UTF8), true);
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(v) = codec.decode(&mut buf).unwrap() {
            out.push(v);
        }
        out
    }

    #[test]
    fn decodes_simple_string() {
        assert_eq!(decode_all(b"+OK\r\n"), vec![Value::Status("OK".into())]);
    }

    #[test]
    fn decodes_error_without_closing() {
        let v = decode_all(b"-ERR bad thing\r\n");
        match &v[0] {
            Value::Error(e) => assert_eq!(e.detail(), "bad thing"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn decodes_integer() {
        assert_eq!(decode_all(b":1000\r\n"), vec![Value::Int(1000)]);
    }

    #[test]
    fn decodes_null_bulk() {
        assert_eq!(decode_all(b"$-1\r\n"), vec![Value::Nil]);
    }

    #[test]
    fn decodes_bulk_text() {
        assert_eq!(decode_all(b"$5\r\nhello\r\n"), vec![Value::Text("hello".into())]);
    }

    #[test]
    fn decodes_empty_multibulk_without_hanging() {
        assert_eq!(decode_all(b"*0\r\n"), vec![Value::Array(Vec::new())]);
    }

    #[test]
    fn decodes_null_multibulk() {
        assert_eq!(decode_all(b"*-1\r\n"), vec![Value::Nil]);
    }

    #[test]
    fn decodes_flat_multibulk() {
        let bytes = b"*3\r\n$3\r\nfoo\r\n$3\r\nbar\r\n:7\r\n";
        assert_eq!(
            decode_all(bytes),
            vec![Value::Array(vec![
                Value::Text("foo".into()),
                Value::Text("bar".into()),
                Value::Int(7),
            ])]
        );
    }

    #[test]
    fn decodes_nested_multibulk() {
        // shape produced by EXEC / SENTINEL MASTERS: an array of arrays.
        let bytes = b"*2\r\n*2\r\n+OK\r\n:1\r\n*1\r\n$3\r\nfoo\r\n";
        assert_eq!(
            decode_all(bytes),
            vec![Value::Array(vec![
                Value::Array(vec![Value::Status("OK".into()), Value::Int(1)]),
                Value::Array(vec![Value::Text("foo".into())]),
            ])]
        );
    }

    #[test]
    fn decoder_resumes_across_partial_chunks() {
        let mut codec = RespCodec::new(Some(&UTF8), true);
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nfo"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"o\r\n:9\r\n");
        let value = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(value, Value::Array(vec![Value::Text("foo".into()), Value::Int(9)]));
    }

    #[test]
    fn encodes_command_as_multibulk() {
        let cmd = Cmd::new("SET").arg("k").arg("v");
        let mut codec = RespCodec::new(Some(&UTF8), true);
        let mut dst = BytesMut::new();
        Encoder::<&Cmd>::encode(&mut codec, &cmd, &mut dst).unwrap();
        assert_eq!(&dst[..], b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
    }
}
