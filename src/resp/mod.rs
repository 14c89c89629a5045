//! RESP2/RESP3 wire protocol
//!
//! Requests are encoded as arrays of bulk strings; replies are decoded
//! incrementally into [`RespValue`].

pub mod decoder;
pub mod encoder;
pub mod value;

pub use decoder::RespDecoder;
pub use encoder::{encode_value, RespEncoder};
pub use value::{ErrorReply, RespValue};
