//! Streaming RESP decoder
//!
//! Socket reads are not aligned to frames, so bytes are fed in as they
//! arrive and complete replies are pulled out one at a time. Parsing runs
//! against a local cursor; the decoder's read position only moves once a
//! whole top-level frame parsed, so an aggregate cut short by the end of the
//! buffer is re-parsed from its first byte on the next attempt.

use std::collections::VecDeque;

use super::value::{ErrorReply, RespValue};
use crate::utils::ProtocolError;

/// Largest bulk payload accepted (matches the server's proto-max-bulk-len default)
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest aggregate element count accepted
const MAX_AGGREGATE_LEN: i64 = i32::MAX as i64;

/// Nesting limit for aggregates
const MAX_DEPTH: usize = 128;

/// Parse outcome for a partially buffered frame
#[derive(Debug)]
enum ParseError {
    Incomplete,
    Invalid(ProtocolError),
}

impl From<ProtocolError> for ParseError {
    fn from(e: ProtocolError) -> Self {
        ParseError::Invalid(e)
    }
}

type ParseResult<T> = Result<T, ParseError>;

/// Incremental RESP2/RESP3 decoder
#[derive(Debug, Default)]
pub struct RespDecoder {
    buf: Vec<u8>,
    /// Start of the first unconsumed byte in `buf`
    pos: usize,
    /// Out-of-band push frames, never returned from `next_reply`
    pushes: VecDeque<RespValue>,
}

impl RespDecoder {
    pub fn new() -> Self {
        Self::with_capacity(16 * 1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            pos: 0,
            pushes: VecDeque::new(),
        }
    }

    /// Append bytes read from the stream
    pub fn feed(&mut self, data: &[u8]) {
        self.compact();
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed by a complete reply
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Parse the next complete reply.
    ///
    /// Returns `Ok(None)` when the buffer holds only part of a frame; nothing
    /// is consumed in that case. Push frames are diverted to the push queue
    /// and parsing continues with the following frame.
    pub fn next_reply(&mut self) -> Result<Option<RespValue>, ProtocolError> {
        loop {
            let mut parser = Parser::new(&self.buf[self.pos..]);
            match parser.parse_value() {
                Ok(value) => {
                    self.pos += parser.cursor;
                    if is_push(&value) {
                        self.pushes.push_back(value);
                        continue;
                    }
                    return Ok(Some(value));
                }
                Err(ParseError::Incomplete) => return Ok(None),
                Err(ParseError::Invalid(e)) => return Err(e),
            }
        }
    }

    /// Whether push frames are waiting to be collected
    pub fn has_pushes(&self) -> bool {
        !self.pushes.is_empty()
    }

    /// Drain queued push frames in arrival order
    pub fn take_pushes(&mut self) -> Vec<RespValue> {
        self.pushes.drain(..).collect()
    }

    /// Drop all buffered state
    pub fn reset(&mut self) {
        self.buf.clear();
        self.pos = 0;
        self.pushes.clear();
    }

    /// Shift unconsumed bytes to the front once the consumed prefix dominates
    fn compact(&mut self) {
        if self.pos == 0 {
            return;
        }
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos >= self.buf.len() / 2 {
            self.buf.copy_within(self.pos.., 0);
            self.buf.truncate(self.buf.len() - self.pos);
            self.pos = 0;
        }
    }
}

fn is_push(value: &RespValue) -> bool {
    match value {
        RespValue::Push(_) => true,
        RespValue::Attribute { value, .. } => is_push(value),
        _ => false,
    }
}

/// Single-pass parser over a borrowed slice
struct Parser<'a> {
    data: &'a [u8],
    cursor: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            cursor: 0,
            depth: 0,
        }
    }

    fn parse_value(&mut self) -> ParseResult<RespValue> {
        let tag = *self.data.get(self.cursor).ok_or(ParseError::Incomplete)?;
        self.cursor += 1;

        match tag {
            b'+' => {
                let line = self.read_line()?;
                Ok(RespValue::SimpleString(
                    String::from_utf8_lossy(line).into_owned(),
                ))
            }
            b'-' => {
                let line = self.read_line()?;
                Ok(RespValue::Error(ErrorReply::parse(&String::from_utf8_lossy(
                    line,
                ))))
            }
            b':' => {
                let line = self.read_line()?;
                Ok(RespValue::Integer(parse_i64(line)?))
            }
            b'$' => {
                let len = self.read_length()?;
                if len < 0 {
                    return Ok(RespValue::Null);
                }
                let payload = self.read_payload(len as usize)?;
                Ok(RespValue::BulkString(payload.to_vec()))
            }
            b'!' => {
                let len = self.read_length()?;
                if len < 0 {
                    return Err(ProtocolError::InvalidLength(len).into());
                }
                let payload = self.read_payload(len as usize)?;
                Ok(RespValue::Error(ErrorReply::parse(&String::from_utf8_lossy(
                    payload,
                ))))
            }
            b'=' => {
                let len = self.read_length()?;
                if len < 4 {
                    return Err(ProtocolError::InvalidLength(len).into());
                }
                let payload = self.read_payload(len as usize)?;
                if payload[3] != b':' {
                    return Err(ProtocolError::Parse(
                        "verbatim string missing format separator".to_string(),
                    )
                    .into());
                }
                Ok(RespValue::Verbatim {
                    format: String::from_utf8_lossy(&payload[..3]).into_owned(),
                    data: payload[4..].to_vec(),
                })
            }
            b',' => {
                let line = self.read_line()?;
                Ok(RespValue::Double(parse_f64(line)?))
            }
            b'#' => match self.read_line()? {
                b"t" => Ok(RespValue::Boolean(true)),
                b"f" => Ok(RespValue::Boolean(false)),
                other => Err(ProtocolError::Parse(format!(
                    "invalid boolean: {}",
                    String::from_utf8_lossy(other)
                ))
                .into()),
            },
            b'(' => {
                let line = self.read_line()?;
                let digits = line.strip_prefix(b"-").unwrap_or(line);
                if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
                    return Err(ProtocolError::Parse(format!(
                        "invalid big number: {}",
                        String::from_utf8_lossy(line)
                    ))
                    .into());
                }
                Ok(RespValue::BigNumber(
                    String::from_utf8_lossy(line).into_owned(),
                ))
            }
            b'_' => {
                let line = self.read_line()?;
                if !line.is_empty() {
                    return Err(ProtocolError::InvalidTerminator.into());
                }
                Ok(RespValue::Null)
            }
            b'*' | b'~' | b'>' => {
                let count = self.read_count()?;
                let Some(count) = count else {
                    return Ok(RespValue::Null);
                };
                let items = self.nested(|p| p.parse_elements(count))?;
                Ok(match tag {
                    b'*' => RespValue::Array(items),
                    b'~' => RespValue::Set(items),
                    _ => RespValue::Push(items),
                })
            }
            b'%' => {
                let Some(count) = self.read_count()? else {
                    return Ok(RespValue::Null);
                };
                let pairs = self.nested(|p| p.parse_pairs(count))?;
                Ok(RespValue::Map(pairs))
            }
            b'|' => {
                let Some(count) = self.read_count()? else {
                    return Err(ProtocolError::InvalidLength(-1).into());
                };
                let attributes = self.nested(|p| p.parse_pairs(count))?;
                let value = self.parse_value()?;
                Ok(RespValue::Attribute {
                    attributes,
                    value: Box::new(value),
                })
            }
            other => Err(ProtocolError::InvalidType(other).into()),
        }
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        if self.depth >= MAX_DEPTH {
            return Err(ProtocolError::Parse("aggregate nesting too deep".to_string()).into());
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn parse_elements(&mut self, count: usize) -> ParseResult<Vec<RespValue>> {
        let mut items = Vec::with_capacity(self.capacity_hint(count));
        for _ in 0..count {
            items.push(self.parse_value()?);
        }
        Ok(items)
    }

    fn parse_pairs(&mut self, count: usize) -> ParseResult<Vec<(RespValue, RespValue)>> {
        let mut pairs = Vec::with_capacity(self.capacity_hint(count));
        for _ in 0..count {
            let key = self.parse_value()?;
            let value = self.parse_value()?;
            pairs.push((key, value));
        }
        Ok(pairs)
    }

    /// Every element takes at least three bytes, so never reserve past that
    fn capacity_hint(&self, count: usize) -> usize {
        count.min((self.data.len() - self.cursor) / 3)
    }

    /// Bytes up to the next CRLF, cursor moved past it
    fn read_line(&mut self) -> ParseResult<&'a [u8]> {
        let rest = &self.data[self.cursor..];
        let cr = rest
            .iter()
            .position(|&b| b == b'\r')
            .ok_or(ParseError::Incomplete)?;
        match rest.get(cr + 1) {
            None => Err(ParseError::Incomplete),
            Some(b'\n') => {
                self.cursor += cr + 2;
                Ok(&rest[..cr])
            }
            Some(_) => Err(ProtocolError::InvalidTerminator.into()),
        }
    }

    /// Exactly `len` bytes followed by CRLF
    fn read_payload(&mut self, len: usize) -> ParseResult<&'a [u8]> {
        let rest = &self.data[self.cursor..];
        if rest.len() < len + 2 {
            return Err(ParseError::Incomplete);
        }
        if &rest[len..len + 2] != b"\r\n" {
            return Err(ProtocolError::InvalidTerminator.into());
        }
        self.cursor += len + 2;
        Ok(&rest[..len])
    }

    /// Signed length header; negative means null
    fn read_length(&mut self) -> ParseResult<i64> {
        let line = self.read_line()?;
        let len = parse_i64(line).map_err(|_| {
            ProtocolError::Parse(format!(
                "invalid length header: {}",
                String::from_utf8_lossy(line)
            ))
        })?;
        if len > MAX_BULK_LEN || len < -1 {
            return Err(ProtocolError::InvalidLength(len).into());
        }
        Ok(len)
    }

    /// Aggregate count header; `None` for a null aggregate
    fn read_count(&mut self) -> ParseResult<Option<usize>> {
        let line = self.read_line()?;
        let count = parse_i64(line).map_err(|_| {
            ProtocolError::Parse(format!(
                "invalid count header: {}",
                String::from_utf8_lossy(line)
            ))
        })?;
        if count < 0 {
            return Ok(None);
        }
        if count > MAX_AGGREGATE_LEN {
            return Err(ProtocolError::InvalidLength(count).into());
        }
        Ok(Some(count as usize))
    }
}

fn parse_i64(line: &[u8]) -> Result<i64, ProtocolError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            ProtocolError::Parse(format!("invalid integer: {}", String::from_utf8_lossy(line)))
        })
}

fn parse_f64(line: &[u8]) -> Result<f64, ProtocolError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            ProtocolError::Parse(format!("invalid double: {}", String::from_utf8_lossy(line)))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::encoder::encode_value;

    fn decode_one(data: &[u8]) -> RespValue {
        let mut decoder = RespDecoder::new();
        decoder.feed(data);
        decoder.next_reply().unwrap().expect("complete reply")
    }

    fn sample_values() -> Vec<RespValue> {
        vec![
            RespValue::Null,
            RespValue::SimpleString("OK".to_string()),
            RespValue::BulkString(b"bin\r\nary\0".to_vec()),
            RespValue::BulkString(Vec::new()),
            RespValue::error("ERR unknown command"),
            RespValue::error("TRYAGAIN"),
            RespValue::Integer(-9_223_372_036_854_775_808),
            RespValue::Double(3.25),
            RespValue::Double(f64::INFINITY),
            RespValue::Boolean(true),
            RespValue::BigNumber("3492890328409238509324850943850943825024385".to_string()),
            RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::Array(vec![RespValue::Null, RespValue::Boolean(false)]),
            ]),
            RespValue::Map(vec![
                (
                    RespValue::SimpleString("first".to_string()),
                    RespValue::Integer(1),
                ),
                (
                    RespValue::BulkString(b"second".to_vec()),
                    RespValue::Set(vec![RespValue::Integer(2)]),
                ),
            ]),
            RespValue::Set(vec![
                RespValue::SimpleString("a".to_string()),
                RespValue::SimpleString("b".to_string()),
            ]),
            RespValue::Verbatim {
                format: "txt".to_string(),
                data: b"Some string".to_vec(),
            },
            RespValue::Attribute {
                attributes: vec![(
                    RespValue::SimpleString("key-popularity".to_string()),
                    RespValue::Double(0.1923),
                )],
                value: Box::new(RespValue::Array(vec![RespValue::Integer(2039123)])),
            },
            RespValue::Array(Vec::new()),
        ]
    }

    #[test]
    fn test_decode_simple_string() {
        assert_eq!(
            decode_one(b"+OK\r\n"),
            RespValue::SimpleString("OK".to_string())
        );
    }

    #[test]
    fn test_decode_error() {
        assert_eq!(
            decode_one(b"-ERR unknown command\r\n"),
            RespValue::Error(ErrorReply::new("ERR", "unknown command"))
        );
    }

    #[test]
    fn test_decode_blob_error() {
        assert_eq!(
            decode_one(b"!21\r\nSYNTAX invalid syntax\r\n"),
            RespValue::Error(ErrorReply::new("SYNTAX", "invalid syntax"))
        );
    }

    #[test]
    fn test_decode_integer() {
        assert_eq!(decode_one(b":1000\r\n"), RespValue::Integer(1000));
    }

    #[test]
    fn test_decode_bulk_string() {
        assert_eq!(
            decode_one(b"$6\r\nfoobar\r\n"),
            RespValue::BulkString(b"foobar".to_vec())
        );
    }

    #[test]
    fn test_decode_nulls() {
        assert_eq!(decode_one(b"$-1\r\n"), RespValue::Null);
        assert_eq!(decode_one(b"*-1\r\n"), RespValue::Null);
        assert_eq!(decode_one(b"_\r\n"), RespValue::Null);
    }

    #[test]
    fn test_decode_resp3_scalars() {
        assert_eq!(decode_one(b",-1.5\r\n"), RespValue::Double(-1.5));
        assert_eq!(decode_one(b",inf\r\n"), RespValue::Double(f64::INFINITY));
        assert_eq!(decode_one(b"#t\r\n"), RespValue::Boolean(true));
        assert_eq!(
            decode_one(b"(-12345678901234567890\r\n"),
            RespValue::BigNumber("-12345678901234567890".to_string())
        );
        match decode_one(b",nan\r\n") {
            RespValue::Double(d) => assert!(d.is_nan()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_array() {
        assert_eq!(
            decode_one(b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n"),
            RespValue::Array(vec![
                RespValue::BulkString(b"foo".to_vec()),
                RespValue::BulkString(b"bar".to_vec()),
            ])
        );
    }

    #[test]
    fn test_decode_map_keeps_pairs() {
        assert_eq!(
            decode_one(b"%2\r\n+a\r\n:1\r\n+b\r\n:2\r\n"),
            RespValue::Map(vec![
                (RespValue::SimpleString("a".into()), RespValue::Integer(1)),
                (RespValue::SimpleString("b".into()), RespValue::Integer(2)),
            ])
        );
    }

    #[test]
    fn test_round_trip_every_variant() {
        for value in sample_values() {
            let bytes = encode_value(&value);
            assert_eq!(decode_one(&bytes), value, "bytes: {:?}", String::from_utf8_lossy(&bytes));
        }
    }

    #[test]
    fn test_split_at_every_boundary() {
        let mut bytes = Vec::new();
        for value in sample_values() {
            bytes.extend(encode_value(&value));
        }
        let expected = sample_values();

        for split in 0..=bytes.len() {
            let mut decoder = RespDecoder::new();
            let mut decoded = Vec::new();

            decoder.feed(&bytes[..split]);
            while let Some(v) = decoder.next_reply().unwrap() {
                decoded.push(v);
            }
            decoder.feed(&bytes[split..]);
            while let Some(v) = decoder.next_reply().unwrap() {
                decoded.push(v);
            }

            assert_eq!(decoded, expected, "split at {}", split);
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let value = RespValue::Map(vec![(
            RespValue::BulkString(b"k".to_vec()),
            RespValue::Array(vec![RespValue::Integer(1), RespValue::Null]),
        )]);
        let bytes = encode_value(&value);

        let mut decoder = RespDecoder::new();
        let mut result = None;
        for (i, b) in bytes.iter().enumerate() {
            decoder.feed(std::slice::from_ref(b));
            let next = decoder.next_reply().unwrap();
            if i + 1 < bytes.len() {
                assert!(next.is_none());
            } else {
                result = next;
            }
        }
        assert_eq!(result, Some(value));
    }

    #[test]
    fn test_incomplete_aggregate_consumes_nothing() {
        let mut decoder = RespDecoder::new();
        decoder.feed(b"*3\r\n:1\r\n:2\r\n");
        assert_eq!(decoder.next_reply().unwrap(), None);
        assert_eq!(decoder.buffered(), 12);

        decoder.feed(b":3\r\n");
        assert_eq!(
            decoder.next_reply().unwrap(),
            Some(RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::Integer(2),
                RespValue::Integer(3),
            ]))
        );
    }

    #[test]
    fn test_incomplete_bulk_keeps_prefix() {
        let mut decoder = RespDecoder::new();
        decoder.feed(b"$10\r\nhello");
        assert_eq!(decoder.next_reply().unwrap(), None);
        decoder.feed(b"world\r\n");
        assert_eq!(
            decoder.next_reply().unwrap(),
            Some(RespValue::BulkString(b"helloworld".to_vec()))
        );
    }

    #[test]
    fn test_pipeline_replies_in_order() {
        let mut decoder = RespDecoder::new();
        decoder.feed(b"+OK\r\n$1\r\nv\r\n:1\r\n");
        assert_eq!(
            decoder.next_reply().unwrap(),
            Some(RespValue::SimpleString("OK".into()))
        );
        assert_eq!(
            decoder.next_reply().unwrap(),
            Some(RespValue::BulkString(b"v".to_vec()))
        );
        assert_eq!(decoder.next_reply().unwrap(), Some(RespValue::Integer(1)));
        assert_eq!(decoder.next_reply().unwrap(), None);
    }

    #[test]
    fn test_push_frames_go_out_of_band() {
        let mut decoder = RespDecoder::new();
        decoder.feed(b">3\r\n+message\r\n+chan\r\n+hello\r\n:7\r\n");
        assert_eq!(decoder.next_reply().unwrap(), Some(RespValue::Integer(7)));
        assert!(decoder.has_pushes());
        assert_eq!(
            decoder.take_pushes(),
            vec![RespValue::Push(vec![
                RespValue::SimpleString("message".into()),
                RespValue::SimpleString("chan".into()),
                RespValue::SimpleString("hello".into()),
            ])]
        );
        assert!(!decoder.has_pushes());
    }

    #[test]
    fn test_push_without_reply_returns_none() {
        let mut decoder = RespDecoder::new();
        decoder.feed(b">1\r\n+invalidate\r\n");
        assert_eq!(decoder.next_reply().unwrap(), None);
        assert_eq!(decoder.take_pushes().len(), 1);
    }

    #[test]
    fn test_attribute_attached_to_following_value() {
        let value = decode_one(b"|1\r\n+ttl\r\n:30\r\n$1\r\nv\r\n");
        assert_eq!(
            value,
            RespValue::Attribute {
                attributes: vec![(RespValue::SimpleString("ttl".into()), RespValue::Integer(30))],
                value: Box::new(RespValue::BulkString(b"v".to_vec())),
            }
        );
    }

    #[test]
    fn test_invalid_type_byte() {
        let mut decoder = RespDecoder::new();
        decoder.feed(b"?oops\r\n");
        assert_eq!(
            decoder.next_reply(),
            Err(ProtocolError::InvalidType(b'?'))
        );
    }

    #[test]
    fn test_malformed_terminators() {
        let mut decoder = RespDecoder::new();
        decoder.feed(b"$3\r\nfooXY");
        assert_eq!(decoder.next_reply(), Err(ProtocolError::InvalidTerminator));

        let mut decoder = RespDecoder::new();
        decoder.feed(b"+OK\rX");
        assert_eq!(decoder.next_reply(), Err(ProtocolError::InvalidTerminator));
    }

    #[test]
    fn test_invalid_headers() {
        let mut decoder = RespDecoder::new();
        decoder.feed(b":12a\r\n");
        assert!(matches!(decoder.next_reply(), Err(ProtocolError::Parse(_))));

        let mut decoder = RespDecoder::new();
        decoder.feed(b"$-5\r\n");
        assert_eq!(decoder.next_reply(), Err(ProtocolError::InvalidLength(-5)));

        let mut decoder = RespDecoder::new();
        decoder.feed(b"#x\r\n");
        assert!(matches!(decoder.next_reply(), Err(ProtocolError::Parse(_))));

        let mut decoder = RespDecoder::new();
        decoder.feed(b"$?\r\n");
        assert!(matches!(decoder.next_reply(), Err(ProtocolError::Parse(_))));
    }

    #[test]
    fn test_compaction_keeps_pending_bytes() {
        let mut decoder = RespDecoder::with_capacity(8);
        for i in 0..100 {
            decoder.feed(format!(":{}\r\n:", i).as_bytes());
            assert_eq!(decoder.next_reply().unwrap(), Some(RespValue::Integer(i)));
            decoder.feed(format!("{}\r\n", i).as_bytes());
            assert_eq!(decoder.next_reply().unwrap(), Some(RespValue::Integer(i)));
        }
        assert_eq!(decoder.buffered(), 0);
    }
}
