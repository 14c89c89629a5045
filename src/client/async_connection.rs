//! Async connection and pool traits, with a tokio TCP pool
//!
//! Mirrors [`super::connection`]; awaiting a reply is the only suspension
//! point on the request path.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::connection::{deliver_pushes, expect_ok, timeout_error, PushSink};
use crate::cluster::{NodeAddress, NodeRole};
use crate::cmd;
use crate::command::Command;
use crate::config::ClusterConfig;
use crate::resp::{RespDecoder, RespEncoder, RespValue};
use crate::utils::{ConnectionError, Result};

#[async_trait]
pub trait AsyncConnection: Send {
    fn address(&self) -> &NodeAddress;

    async fn write_commands(&mut self, commands: &[&Command]) -> Result<()>;

    async fn read_reply(&mut self, timeout: Option<Duration>) -> Result<RespValue>;
}

#[async_trait]
pub trait AsyncConnectionPool: Send + Sync {
    type Conn: AsyncConnection;

    async fn checkout(&self, node: &NodeAddress, role: NodeRole) -> Result<Self::Conn>;

    fn checkin(&self, conn: Self::Conn, healthy: bool);
}

/// Extension trait with common node operations
#[async_trait]
pub trait AsyncConnectionExt: AsyncConnection {
    async fn call(&mut self, command: &Command, timeout: Option<Duration>) -> Result<RespValue> {
        self.write_commands(&[command]).await?;
        self.read_reply(timeout).await
    }

    async fn ping(&mut self, timeout: Option<Duration>) -> Result<bool> {
        match self.call(&cmd!("PING"), timeout).await? {
            RespValue::SimpleString(s) => Ok(s == "PONG"),
            _ => Ok(false),
        }
    }

    async fn cluster_nodes(&mut self, timeout: Option<Duration>) -> Result<RespValue> {
        self.call(&cmd!("CLUSTER", "NODES"), timeout).await
    }

    async fn readonly(&mut self, timeout: Option<Duration>) -> Result<()> {
        expect_ok(self.call(&cmd!("READONLY"), timeout).await?)
    }
}

impl<T: AsyncConnection + ?Sized> AsyncConnectionExt for T {}

/// RESP connection over any tokio stream
pub struct AsyncRespConnection<S> {
    stream: S,
    address: NodeAddress,
    encoder: RespEncoder,
    decoder: RespDecoder,
    read_buf: Vec<u8>,
    push_sink: Option<PushSink>,
}

impl<S> AsyncRespConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
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
}

#[async_trait]
impl<S> AsyncConnection for AsyncRespConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    async fn write_commands(&mut self, commands: &[&Command]) -> Result<()> {
        let bytes = self.encoder.encode_pipeline(commands.iter().copied());
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_reply(&mut self, timeout: Option<Duration>) -> Result<RespValue> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let reply = self.decoder.next_reply()?;
            deliver_pushes(&mut self.decoder, self.push_sink.as_ref());
            if let Some(reply) = reply {
                return Ok(reply);
            }

            let read = self.stream.read(&mut self.read_buf);
            let n = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(timeout_error(timeout));
                    }
                    tokio::time::timeout(remaining, read)
                        .await
                        .map_err(|_| timeout_error(timeout))??
                }
                None => read.await?,
            };
            if n == 0 {
                return Err(ConnectionError::Closed.into());
            }
            self.decoder.feed(&self.read_buf[..n]);
        }
    }
}

/// Open a tokio TCP connection with Nagle disabled
pub async fn connect_tcp_async(
    address: &NodeAddress,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let connect = TcpStream::connect((address.host.as_str(), address.port));
    let stream = match tokio::time::timeout(connect_timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(ConnectionError::ConnectFailed {
                host: address.host.clone(),
                port: address.port,
                source,
            }
            .into())
        }
        Err(_) => {
            return Err(ConnectionError::ConnectFailed {
                host: address.host.clone(),
                port: address.port,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            }
            .into())
        }
    };
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Tokio TCP connection tagged with the role it was opened for
pub struct AsyncPooledConnection {
    conn: AsyncRespConnection<TcpStream>,
    role: NodeRole,
}

impl AsyncPooledConnection {
    pub fn role(&self) -> NodeRole {
        self.role
    }
}

#[async_trait]
impl AsyncConnection for AsyncPooledConnection {
    fn address(&self) -> &NodeAddress {
        self.conn.address()
    }

    async fn write_commands(&mut self, commands: &[&Command]) -> Result<()> {
        self.conn.write_commands(commands).await
    }

    async fn read_reply(&mut self, timeout: Option<Duration>) -> Result<RespValue> {
        self.conn.read_reply(timeout).await
    }
}

/// Idle connection lists per node and role
pub struct AsyncNodePool {
    connect_timeout: Duration,
    setup_timeout: Duration,
    push_sink: Option<PushSink>,
    idle: Mutex<HashMap<(NodeAddress, NodeRole), Vec<AsyncPooledConnection>>>,
    max_idle_per_node: usize,
}

impl AsyncNodePool {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            setup_timeout: config.request_timeout,
            push_sink: None,
            idle: Mutex::new(HashMap::new()),
            max_idle_per_node: config.max_idle_per_node,
        }
    }

    pub fn with_push_sink(mut self, sink: PushSink) -> Self {
        self.push_sink = Some(sink);
        self
    }

    pub fn idle_count(&self, node: &NodeAddress) -> usize {
        self.idle
            .lock()
            .iter()
            .filter(|((address, _), _)| address == node)
            .map(|(_, conns)| conns.len())
            .sum()
    }

    async fn open(&self, node: &NodeAddress, role: NodeRole) -> Result<AsyncPooledConnection> {
        let stream = connect_tcp_async(node, self.connect_timeout).await?;
        let mut conn = AsyncPooledConnection {
            conn: AsyncRespConnection::new(stream, node.clone())
                .with_push_sink(self.push_sink.clone()),
            role,
        };
        if role == NodeRole::Replica {
            conn.readonly(Some(self.setup_timeout)).await?;
        }
        debug!("Opened {:?} connection to {}", role, node);
        Ok(conn)
    }
}

#[async_trait]
impl AsyncConnectionPool for AsyncNodePool {
    type Conn = AsyncPooledConnection;

    async fn checkout(&self, node: &NodeAddress, role: NodeRole) -> Result<AsyncPooledConnection> {
        let idle = self
            .idle
            .lock()
            .get_mut(&(node.clone(), role))
            .and_then(|conns| conns.pop());
        match idle {
            Some(conn) => Ok(conn),
            None => self.open(node, role).await,
        }
    }

    fn checkin(&self, conn: AsyncPooledConnection, healthy: bool) {
        if !healthy {
            debug!("Discarding connection to {}", conn.address());
            return;
        }
        let mut idle = self.idle.lock();
        let conns = idle
            .entry((conn.address().clone(), conn.role))
            .or_default();
        if conns.len() < self.max_idle_per_node {
            conns.push(conn);
        }
    }
}
