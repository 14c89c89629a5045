//! RESP encoder
//!
//! Requests are always encoded as an array of bulk strings. A pipeline is
//! just several such frames back to back in one buffer, so the whole batch
//! goes out in a single write.

use std::io::Write;

use super::value::RespValue;
use crate::command::Command;

const CRLF: &[u8] = b"\r\n";

/// ASCII digits for 0..100, so the common small headers skip integer formatting
const DIGIT_PAIRS: [[u8; 2]; 100] = build_digit_pairs();

const fn build_digit_pairs() -> [[u8; 2]; 100] {
    let mut table = [[0u8; 2]; 100];
    let mut i = 0;
    while i < 100 {
        table[i] = [b'0' + (i / 10) as u8, b'0' + (i % 10) as u8];
        i += 1;
    }
    table
}

/// RESP encoder with a reusable buffer
pub struct RespEncoder {
    buf: Vec<u8>,
}

impl Default for RespEncoder {
    fn default() -> Self {
        Self::with_capacity(4096)
    }
}

impl RespEncoder {
    /// Create new encoder with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Clear buffer for reuse
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Get encoded bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Take ownership of buffer
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Encode a single command, replacing previous buffer contents
    pub fn encode(&mut self, command: &Command) -> &[u8] {
        self.buf.clear();
        self.append_command(command.args());
        &self.buf
    }

    /// Encode several commands into one buffer, replacing previous contents
    pub fn encode_pipeline<'a, I>(&mut self, commands: I) -> &[u8]
    where
        I: IntoIterator<Item = &'a Command>,
    {
        self.buf.clear();
        for command in commands {
            self.append_command(command.args());
        }
        &self.buf
    }

    /// Append a command as a RESP array of bulk strings
    pub fn append_command<A: AsRef<[u8]>>(&mut self, args: &[A]) {
        // Array header: *<count>\r\n
        self.write_header(b'*', args.len() as i64);

        // Each argument as bulk string: $<len>\r\n<data>\r\n
        for arg in args {
            let arg = arg.as_ref();
            self.write_header(b'$', arg.len() as i64);
            self.buf.extend_from_slice(arg);
            self.buf.extend_from_slice(CRLF);
        }
    }

    /// Append a command from string slices
    pub fn append_command_str(&mut self, args: &[&str]) {
        let byte_args: Vec<&[u8]> = args.iter().map(|s| s.as_bytes()).collect();
        self.append_command(&byte_args);
    }

    /// Append any reply value in server (RESP3) form
    pub fn encode_value(&mut self, value: &RespValue) {
        match value {
            RespValue::Null => self.buf.extend_from_slice(b"_\r\n"),
            RespValue::SimpleString(s) => self.write_line(b'+', s.as_bytes()),
            RespValue::Error(e) => self.write_line(b'-', e.to_string().as_bytes()),
            RespValue::Integer(n) => self.write_header(b':', *n),
            RespValue::Double(d) => {
                self.buf.push(b',');
                if d.is_nan() {
                    self.buf.extend_from_slice(b"nan");
                } else if d.is_infinite() {
                    let text: &[u8] = if *d > 0.0 { b"inf" } else { b"-inf" };
                    self.buf.extend_from_slice(text);
                } else {
                    // Vec<u8> writes never fail
                    let _ = write!(self.buf, "{}", d);
                }
                self.buf.extend_from_slice(CRLF);
            }
            RespValue::Boolean(b) => {
                self.buf
                    .extend_from_slice(if *b { b"#t\r\n" } else { b"#f\r\n" });
            }
            RespValue::BigNumber(n) => self.write_line(b'(', n.as_bytes()),
            RespValue::BulkString(data) => {
                self.write_header(b'$', data.len() as i64);
                self.buf.extend_from_slice(data);
                self.buf.extend_from_slice(CRLF);
            }
            RespValue::Verbatim { format, data } => {
                self.write_header(b'=', (format.len() + 1 + data.len()) as i64);
                self.buf.extend_from_slice(format.as_bytes());
                self.buf.push(b':');
                self.buf.extend_from_slice(data);
                self.buf.extend_from_slice(CRLF);
            }
            RespValue::Array(items) => self.write_aggregate(b'*', items),
            RespValue::Set(items) => self.write_aggregate(b'~', items),
            RespValue::Push(items) => self.write_aggregate(b'>', items),
            RespValue::Map(pairs) => self.write_pairs(b'%', pairs),
            RespValue::Attribute { attributes, value } => {
                self.write_pairs(b'|', attributes);
                self.encode_value(value);
            }
        }
    }

    fn write_aggregate(&mut self, tag: u8, items: &[RespValue]) {
        self.write_header(tag, items.len() as i64);
        for item in items {
            self.encode_value(item);
        }
    }

    fn write_pairs(&mut self, tag: u8, pairs: &[(RespValue, RespValue)]) {
        self.write_header(tag, pairs.len() as i64);
        for (k, v) in pairs {
            self.encode_value(k);
            self.encode_value(v);
        }
    }

    fn write_line(&mut self, tag: u8, content: &[u8]) {
        self.buf.push(tag);
        self.buf.extend_from_slice(content);
        self.buf.extend_from_slice(CRLF);
    }

    /// Tag byte, decimal value, CRLF
    #[inline]
    fn write_header(&mut self, tag: u8, value: i64) {
        self.buf.push(tag);
        self.write_int(value);
        self.buf.extend_from_slice(CRLF);
    }

    #[inline]
    fn write_int(&mut self, value: i64) {
        if (0..10).contains(&value) {
            self.buf.push(b'0' + value as u8);
        } else if (10..100).contains(&value) {
            self.buf.extend_from_slice(&DIGIT_PAIRS[value as usize]);
        } else {
            let mut buffer = itoa::Buffer::new();
            self.buf.extend_from_slice(buffer.format(value).as_bytes());
        }
    }
}

/// Encode a single value into a fresh buffer
pub fn encode_value(value: &RespValue) -> Vec<u8> {
    let mut encoder = RespEncoder::with_capacity(64);
    encoder.encode_value(value);
    encoder.into_bytes()
}
