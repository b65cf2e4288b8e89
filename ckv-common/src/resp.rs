//! # RESP2/RESP3 Encoding and Parsing
//!
//! Purpose: Encode client commands and parse node replies incrementally from
//! a byte buffer that may hold partial or multiple frames.
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: `parse_value` returns `Ok(None)` until a whole
//!    frame is buffered, and the consumed length once it is.
//! 2. **Buffer Reuse**: Callers own the `BytesMut` for both directions.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.
//!
//! Requests are always RESP arrays of bulk strings; only replies differ
//! between protocol versions. RESP3 attributes (`|`) are parsed and dropped.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::error::{ProtocolError, ProtocolResult};
use crate::value::{ServerError, Value};

/// Wire protocol negotiated with each node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// Classic protocol, no handshake required.
    #[default]
    Resp2,
    /// Richer reply types, negotiated with `HELLO 3`.
    Resp3,
}

/// Encodes a command as a RESP array of bulk strings into `out`.
pub fn encode_command(cmd: &Command, out: &mut BytesMut) {
    out.reserve(16 + cmd.args().iter().map(|a| a.len() + 16).sum::<usize>());
    out.put_u8(b'*');
    push_usize(out, cmd.frame_len());
    out.put_slice(b"\r\n");
    push_bulk(out, cmd.name());
    for arg in cmd.args() {
        push_bulk(out, arg);
    }
}

/// Parses one value from the front of `buf`.
///
/// Returns the value and the number of bytes it occupied, or `None` when the
/// buffer does not yet hold a complete frame.
pub fn parse_value(buf: &[u8]) -> ProtocolResult<Option<(Value, usize)>> {
    let mut cursor = Cursor { buf, pos: 0 };
    Ok(cursor.value()?.map(|value| (value, cursor.pos)))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn value(&mut self) -> ProtocolResult<Option<Value>> {
        let buf = self.buf;
        let Some(&prefix) = buf.get(self.pos) else {
            return Ok(None);
        };
        if !is_known_prefix(prefix) {
            return Err(ProtocolError::InvalidPrefix(prefix));
        }
        self.pos += 1;
        let Some(line) = self.line() else {
            return Ok(None);
        };

        let value = match prefix {
            b'+' => Value::SimpleString(utf8(line)?),
            b'-' => Value::ServerError(ServerError::new(utf8(line)?)),
            b':' => Value::Int(parse_i64(line)?),
            b'_' => Value::Nil,
            b',' => Value::Double(parse_double(line)?),
            b'#' => match line {
                b"t" => Value::Boolean(true),
                b"f" => Value::Boolean(false),
                _ => return Err(ProtocolError::InvalidBoolean),
            },
            b'(' => Value::BigNumber(utf8(line)?),
            b'$' | b'!' | b'=' => {
                let len = parse_len(line)?;
                if len < 0 {
                    return Ok(Some(Value::Nil));
                }
                let Some(data) = self.blob(len as usize)? else {
                    return Ok(None);
                };
                match prefix {
                    b'$' => Value::BulkString(Bytes::copy_from_slice(data)),
                    b'!' => Value::ServerError(ServerError::new(utf8(data)?)),
                    _ => verbatim(data)?,
                }
            }
            b'*' | b'~' | b'>' => {
                let len = parse_len(line)?;
                if len < 0 {
                    return Ok(Some(Value::Nil));
                }
                let Some(items) = self.aggregate(len as usize)? else {
                    return Ok(None);
                };
                match prefix {
                    b'*' => Value::Array(items),
                    b'~' => Value::Set(items),
                    _ => push(items),
                }
            }
            b'%' | b'|' => {
                let len = parse_len(line)?;
                if len < 0 {
                    return Err(ProtocolError::InvalidLength(len));
                }
                let Some(items) = self.aggregate(len as usize * 2)? else {
                    return Ok(None);
                };
                if prefix == b'|' {
                    // Attribute metadata precedes the real reply.
                    return self.value();
                }
                let mut pairs = Vec::with_capacity(items.len() / 2);
                let mut iter = items.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    pairs.push((k, v));
                }
                Value::Map(pairs)
            }
            other => return Err(ProtocolError::InvalidPrefix(other)),
        };
        Ok(Some(value))
    }

    fn line(&mut self) -> Option<&'a [u8]> {
        let rest: &'a [u8] = &self.buf[self.pos..];
        let idx = rest.windows(2).position(|w| w == b"\r\n")?;
        self.pos += idx + 2;
        Some(&rest[..idx])
    }

    fn blob(&mut self, len: usize) -> ProtocolResult<Option<&'a [u8]>> {
        let rest: &'a [u8] = &self.buf[self.pos..];
        if rest.len() < len + 2 {
            return Ok(None);
        }
        if &rest[len..len + 2] != b"\r\n" {
            return Err(ProtocolError::MissingCrlf);
        }
        self.pos += len + 2;
        Ok(Some(&rest[..len]))
    }

    fn aggregate(&mut self, len: usize) -> ProtocolResult<Option<Vec<Value>>> {
        // Cap the pre-allocation; the declared length is untrusted.
        let mut items = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            match self.value()? {
                Some(item) => items.push(item),
                None => return Ok(None),
            }
        }
        Ok(Some(items))
    }
}

fn is_known_prefix(prefix: u8) -> bool {
    matches!(
        prefix,
        b'+' | b'-' | b':' | b'$' | b'*' | b'_' | b',' | b'#' | b'(' | b'!' | b'=' | b'%' | b'~'
            | b'>' | b'|'
    )
}

fn push(mut items: Vec<Value>) -> Value {
    let kind = if items.is_empty() {
        String::new()
    } else {
        match items.remove(0) {
            Value::BulkString(data) => String::from_utf8_lossy(&data).into_owned(),
            Value::SimpleString(text) => text,
            _ => String::new(),
        }
    };
    Value::Push { kind, data: items }
}

fn verbatim(data: &[u8]) -> ProtocolResult<Value> {
    let text = utf8(data)?;
    match text.split_once(':') {
        Some((format, body)) if format.len() == 3 => Ok(Value::VerbatimString {
            format: format.to_string(),
            text: body.to_string(),
        }),
        _ => Ok(Value::VerbatimString {
            format: String::new(),
            text,
        }),
    }
}

fn utf8(data: &[u8]) -> ProtocolResult<String> {
    std::str::from_utf8(data)
        .map(str::to_string)
        .map_err(|_| ProtocolError::InvalidUtf8)
}

fn parse_len(data: &[u8]) -> ProtocolResult<i64> {
    if data == b"?" {
        return Err(ProtocolError::Unsupported("streamed aggregate"));
    }
    let len = parse_i64(data)?;
    if len < -1 {
        return Err(ProtocolError::InvalidLength(len));
    }
    Ok(len)
}

fn parse_double(data: &[u8]) -> ProtocolResult<f64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or(ProtocolError::InvalidDouble)
}

fn parse_i64(data: &[u8]) -> ProtocolResult<i64> {
    if data.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }
    let (negative, digits) = match data[0] {
        b'-' => (true, &data[1..]),
        b'+' => (false, &data[1..]),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_bulk(out: &mut BytesMut, data: &[u8]) {
    out.put_u8(b'$');
    push_usize(out, data.len());
    out.put_slice(b"\r\n");
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

fn push_usize(out: &mut BytesMut, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.put_u8(buf[idx]);
    }
}
