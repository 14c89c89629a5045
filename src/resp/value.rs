//! RESP2/RESP3 reply values

use std::fmt;

use crate::utils::{ClientError, Result};

/// Error reply split into its leading code and the rest of the message.
///
/// `-ERR unknown command` becomes `code = "ERR"`, `message = "unknown command"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: String,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Split a raw error line on its first space
    pub fn parse(line: &str) -> Self {
        match line.split_once(' ') {
            Some((code, message)) => Self::new(code, message),
            None => Self::new(line, ""),
        }
    }
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} {}", self.code, self.message)
        }
    }
}

/// RESP value types
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Null (`_\r\n`, `$-1\r\n` or `*-1\r\n`)
    Null,
    /// Simple string (+OK\r\n)
    SimpleString(String),
    /// Bulk string ($6\r\nfoobar\r\n)
    BulkString(Vec<u8>),
    /// Error (-ERR message\r\n or !len blob error)
    Error(ErrorReply),
    /// Integer (:1000\r\n)
    Integer(i64),
    /// Double (,3.14\r\n)
    Double(f64),
    /// Boolean (#t\r\n)
    Boolean(bool),
    /// Big number kept in its decimal text form ((3492890328409238509324850943850943825024385\r\n)
    BigNumber(String),
    /// Array (*2\r\n...)
    Array(Vec<RespValue>),
    /// Map (%2\r\n...), pairs in wire order
    Map(Vec<(RespValue, RespValue)>),
    /// Set (~2\r\n...), wire order preserved
    Set(Vec<RespValue>),
    /// Verbatim string (=15\r\ntxt:Some string\r\n)
    Verbatim { format: String, data: Vec<u8> },
    /// Out-of-band push (>3\r\n...)
    Push(Vec<RespValue>),
    /// Attribute metadata attached to the value that follows it
    Attribute {
        attributes: Vec<(RespValue, RespValue)>,
        value: Box<RespValue>,
    },
}

impl RespValue {
    /// Shorthand for an error reply built from a raw line
    pub fn error(line: &str) -> Self {
        RespValue::Error(ErrorReply::parse(line))
    }

    /// Check if this is an error response
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    /// The error reply, if this is one
    pub fn as_error(&self) -> Option<&ErrorReply> {
        match self {
            RespValue::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Get as string (for simple, bulk or verbatim strings)
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok(),
            RespValue::Verbatim { data, .. } => std::str::from_utf8(data).ok(),
            _ => None,
        }
    }

    /// Get as bytes (for bulk or verbatim strings)
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(b) => Some(b),
            RespValue::Verbatim { data, .. } => Some(data),
            RespValue::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Get as integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RespValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as array (arrays, sets and pushes all carry ordered elements)
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(arr) | RespValue::Set(arr) | RespValue::Push(arr) => Some(arr),
            _ => None,
        }
    }

    /// Strip attribute metadata, returning the underlying value
    pub fn into_inner(self) -> RespValue {
        match self {
            RespValue::Attribute { value, .. } => value.into_inner(),
            other => other,
        }
    }

    /// Convert an error reply into `ClientError::Server`
    pub fn into_result(self) -> Result<RespValue> {
        match self {
            RespValue::Error(e) => Err(ClientError::Server(e)),
            other => Ok(other),
        }
    }

    /// Short name of the variant, used in diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            RespValue::Null => "null",
            RespValue::SimpleString(_) => "simple-string",
            RespValue::BulkString(_) => "bulk-string",
            RespValue::Error(_) => "error",
            RespValue::Integer(_) => "integer",
            RespValue::Double(_) => "double",
            RespValue::Boolean(_) => "boolean",
            RespValue::BigNumber(_) => "big-number",
            RespValue::Array(_) => "array",
            RespValue::Map(_) => "map",
            RespValue::Set(_) => "set",
            RespValue::Verbatim { .. } => "verbatim",
            RespValue::Push(_) => "push",
            RespValue::Attribute { .. } => "attribute",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_reply_split() {
        let e = ErrorReply::parse("ERR unknown command 'FOO'");
        assert_eq!(e.code, "ERR");
        assert_eq!(e.message, "unknown command 'FOO'");
        assert_eq!(e.to_string(), "ERR unknown command 'FOO'");
    }

    #[test]
    fn test_error_reply_code_only() {
        let e = ErrorReply::parse("TRYAGAIN");
        assert_eq!(e.code, "TRYAGAIN");
        assert!(e.message.is_empty());
        assert_eq!(e.to_string(), "TRYAGAIN");
    }

    #[test]
    fn test_into_result() {
        assert!(RespValue::error("ERR boom").into_result().is_err());
        assert_eq!(
            RespValue::Integer(1).into_result().unwrap(),
            RespValue::Integer(1)
        );
    }

    #[test]
    fn test_into_inner_strips_attributes() {
        let value = RespValue::Attribute {
            attributes: vec![(
                RespValue::SimpleString("ttl".to_string()),
                RespValue::Integer(3),
            )],
            value: Box::new(RespValue::Integer(7)),
        };
        assert_eq!(value.into_inner(), RespValue::Integer(7));
    }

    #[test]
    fn test_as_str_variants() {
        assert_eq!(RespValue::SimpleString("OK".into()).as_str(), Some("OK"));
        assert_eq!(RespValue::BulkString(b"abc".to_vec()).as_str(), Some("abc"));
        assert_eq!(RespValue::BulkString(vec![0xff, 0xfe]).as_str(), None);
        assert_eq!(RespValue::Integer(1).as_str(), None);
    }
}
