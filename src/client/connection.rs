//! Blocking connection and pool traits
//!
//! The cluster client only needs two things from a connection: write a batch
//! of commands in one go and read the next reply. Everything else (sockets,
//! READONLY, idle lists) lives behind [`ConnectionPool`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use super::stream::{ByteStream, ReadOutcome};
use crate::cluster::{NodeAddress, NodeRole};
use crate::cmd;
use crate::command::Command;
use crate::resp::{RespDecoder, RespEncoder, RespValue};
use crate::utils::{ClientError, ConnectionError, ProtocolError, Result};

/// Receiver for out-of-band push frames
pub type PushSink = Arc<dyn Fn(RespValue) + Send + Sync>;

/// A connection to one node
pub trait Connection: Send {
    /// Node this connection talks to
    fn address(&self) -> &NodeAddress;

    /// Encode `commands` back to back and send them in a single write
    fn write_commands(&mut self, commands: &[&Command]) -> Result<()>;

    /// Next reply in command order
    fn read_reply(&mut self, timeout: Option<Duration>) -> Result<RespValue>;
}

/// Source of node connections
pub trait ConnectionPool: Send + Sync {
    type Conn: Connection;

    /// Borrow a connection to `node`; replica connections are put in READONLY mode
    fn checkout(&self, node: &NodeAddress, role: NodeRole) -> Result<Self::Conn>;

    /// Return a connection; unhealthy ones are dropped
    fn checkin(&self, conn: Self::Conn, healthy: bool);
}

/// Extension trait with common node operations
pub trait ConnectionExt: Connection {
    /// Send one command and wait for its reply
    fn call(&mut self, command: &Command, timeout: Option<Duration>) -> Result<RespValue> {
        self.write_commands(&[command])?;
        self.read_reply(timeout)
    }

    /// Send PING and verify PONG response
    fn ping(&mut self, timeout: Option<Duration>) -> Result<bool> {
        match self.call(&cmd!("PING"), timeout)? {
            RespValue::SimpleString(s) => Ok(s == "PONG"),
            _ => Ok(false),
        }
    }

    /// Raw CLUSTER NODES reply
    fn cluster_nodes(&mut self, timeout: Option<Duration>) -> Result<RespValue> {
        self.call(&cmd!("CLUSTER", "NODES"), timeout)
    }

    /// Enable replica reads on this connection
    fn readonly(&mut self, timeout: Option<Duration>) -> Result<()> {
        expect_ok(self.call(&cmd!("READONLY"), timeout)?)
    }
}

impl<T: Connection + ?Sized> ConnectionExt for T {}

/// `+OK`, or the server error / unexpected reply as an error
pub(crate) fn expect_ok(reply: RespValue) -> Result<()> {
    match reply {
        RespValue::SimpleString(s) if s == "OK" => Ok(()),
        RespValue::Error(e) => Err(ClientError::Server(e)),
        other => Err(ProtocolError::UnexpectedResponse {
            expected: "OK".to_string(),
            actual: other.kind().to_string(),
        }
        .into()),
    }
}

/// Hand queued push frames to the sink, or drop them
pub(crate) fn deliver_pushes(decoder: &mut RespDecoder, sink: Option<&PushSink>) {
    if !decoder.has_pushes() {
        return;
    }
    for push in decoder.take_pushes() {
        match sink {
            Some(sink) => sink(push),
            None => debug!("Dropping push frame without a sink: {:?}", push),
        }
    }
}

/// RESP connection over any blocking byte stream
pub struct RespConnection<S: ByteStream> {
    stream: S,
    address: NodeAddress,
    encoder: RespEncoder,
    decoder: RespDecoder,
    read_buf: Vec<u8>,
    push_sink: Option<PushSink>,
}

impl<S: ByteStream> RespConnection<S> {
    pub fn new(stream: S, address: NodeAddress) -> Self {
        Self {
            stream,
            address,
            encoder: RespEncoder::default(),
            decoder: RespDecoder::new(),
            read_buf: vec![0u8; 64 * 1024],
            push_sink: None,
        }
    }

    pub fn with_push_sink(mut self, sink: Option<PushSink>) -> Self {
        self.push_sink = sink;
        self
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

impl<S: ByteStream> Connection for RespConnection<S> {
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    fn write_commands(&mut self, commands: &[&Command]) -> Result<()> {
        let bytes = self.encoder.encode_pipeline(commands.iter().copied());
        self.stream.write_all(bytes)?;
        Ok(())
    }

    fn read_reply(&mut self, timeout: Option<Duration>) -> Result<RespValue> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let reply = self.decoder.next_reply()?;
            deliver_pushes(&mut self.decoder, self.push_sink.as_ref());
            if let Some(reply) = reply {
                return Ok(reply);
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(timeout_error(timeout));
                    }
                    Some(remaining)
                }
                None => None,
            };

            match self.stream.read(&mut self.read_buf, remaining)? {
                ReadOutcome::Data(n) => self.decoder.feed(&self.read_buf[..n]),
                ReadOutcome::WouldBlock => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(timeout_error(timeout));
                    }
                }
                ReadOutcome::Closed => return Err(ConnectionError::Closed.into()),
            }
        }
    }
}

pub(crate) fn timeout_error(timeout: Option<Duration>) -> ClientError {
    let ms = timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
    ConnectionError::Timeout(ms).into()
}
