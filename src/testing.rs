//! In-process cluster double for driver tests
//!
//! Requests go through the real encoder and are decoded back with
//! `RespDecoder`; replies are encoded with `encode_value` and fed to the
//! connection's own decoder, so routing tests exercise the full codec path.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::client::connection::timeout_error;
use crate::client::{AsyncConnection, AsyncConnectionPool, Connection, ConnectionPool};
use crate::cluster::{NodeAddress, NodeRole};
use crate::command::Command;
use crate::resp::{encode_value, RespDecoder, RespEncoder, RespValue};
use crate::utils::{ConnectionError, Result};

/// Primaries on :7001 (slots 0-8191) and :7002 (8192-16383), replica of
/// :7001 on :7003
pub(crate) const TWO_SHARDS: &str = "\
aaa 127.0.0.1:7001@17001 myself,master - 0 0 1 connected 0-8191
bbb 127.0.0.1:7002@17002 master - 0 0 2 connected 8192-16383
ccc 127.0.0.1:7003@17003 slave aaa 0 0 1 connected
";

/// Slot 5061, served by :7001
pub(crate) const LOW_KEY: &str = "bar";
/// Slot 12182, served by :7002
pub(crate) const HIGH_KEY: &str = "foo";

type Handler = dyn Fn(&NodeAddress, &[String]) -> RespValue + Send + Sync;

pub(crate) fn node(port: u16) -> NodeAddress {
    NodeAddress::new("127.0.0.1", port)
}

struct Inner {
    topology: Mutex<String>,
    handler: Box<Handler>,
    down: Mutex<HashSet<NodeAddress>>,
    log: Mutex<Vec<(NodeAddress, Vec<String>)>>,
    checkouts: AtomicUsize,
    discarded: AtomicUsize,
    /// Replies delivered before the next write's connection drops
    close_after: Mutex<Option<usize>>,
    connect_latency: Mutex<Duration>,
}

/// Scripted cluster acting as both a blocking and an async pool.
///
/// `CLUSTER NODES` is answered from the current topology text; every other
/// command goes to the handler.
#[derive(Clone)]
pub(crate) struct MockCluster {
    inner: Arc<Inner>,
}

impl MockCluster {
    pub fn new<F>(topology: &str, handler: F) -> Self
    where
        F: Fn(&NodeAddress, &[String]) -> RespValue + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                topology: Mutex::new(topology.to_string()),
                handler: Box::new(handler),
                down: Mutex::new(HashSet::new()),
                log: Mutex::new(Vec::new()),
                checkouts: AtomicUsize::new(0),
                discarded: AtomicUsize::new(0),
                close_after: Mutex::new(None),
                connect_latency: Mutex::new(Duration::ZERO),
            }),
        }
    }

    pub fn set_topology(&self, text: &str) {
        *self.inner.topology.lock() = text.to_string();
    }

    pub fn set_down(&self, node: NodeAddress) {
        self.inner.down.lock().insert(node);
    }

    /// The next write runs every command server-side, but its connection
    /// drops after delivering `replies` replies
    pub fn close_after_replies(&self, replies: usize) {
        *self.inner.close_after.lock() = Some(replies);
    }

    /// Every checkout blocks this long before connecting or failing
    pub fn set_connect_latency(&self, latency: Duration) {
        *self.inner.connect_latency.lock() = latency;
    }

    pub fn log(&self) -> Vec<(NodeAddress, Vec<String>)> {
        self.inner.log.lock().clone()
    }

    /// Nodes that received `name`, in order
    pub fn sent(&self, name: &str) -> Vec<NodeAddress> {
        self.inner
            .log
            .lock()
            .iter()
            .filter(|(_, args)| args.first().is_some_and(|a| a.eq_ignore_ascii_case(name)))
            .map(|(node, _)| node.clone())
            .collect()
    }

    pub fn checkouts(&self) -> usize {
        self.inner.checkouts.load(Ordering::SeqCst)
    }

    pub fn discarded(&self) -> usize {
        self.inner.discarded.load(Ordering::SeqCst)
    }

    fn open(&self, node: &NodeAddress) -> Result<MockConnection> {
        self.inner.checkouts.fetch_add(1, Ordering::SeqCst);
        let latency = *self.inner.connect_latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        if self.inner.down.lock().contains(node) {
            return Err(ConnectionError::ConnectFailed {
                host: node.host.clone(),
                port: node.port,
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "node is down"),
            }
            .into());
        }
        Ok(MockConnection {
            cluster: self.clone(),
            address: node.clone(),
            encoder: RespEncoder::default(),
            replies: RespDecoder::new(),
            closed: false,
        })
    }

    fn answer(&self, node: &NodeAddress, args: Vec<String>) -> RespValue {
        let is_cluster_nodes = args.len() == 2
            && args[0].eq_ignore_ascii_case("CLUSTER")
            && args[1].eq_ignore_ascii_case("NODES");
        let reply = if is_cluster_nodes {
            RespValue::BulkString(self.inner.topology.lock().clone().into_bytes())
        } else {
            (self.inner.handler)(node, &args)
        };
        self.inner.log.lock().push((node.clone(), args));
        reply
    }

    fn release(&self, healthy: bool) {
        if !healthy {
            self.inner.discarded.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub(crate) struct MockConnection {
    cluster: MockCluster,
    address: NodeAddress,
    encoder: RespEncoder,
    replies: RespDecoder,
    closed: bool,
}

impl Connection for MockConnection {
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    fn write_commands(&mut self, commands: &[&Command]) -> Result<()> {
        let close_after = self.cluster.inner.close_after.lock().take();
        let mut requests = RespDecoder::new();
        requests.feed(self.encoder.encode_pipeline(commands.iter().copied()));
        let mut answered = 0;
        while let Some(request) = requests.next_reply()? {
            let args = request
                .as_array()
                .unwrap_or_default()
                .iter()
                .map(|arg| String::from_utf8_lossy(arg.as_bytes().unwrap_or_default()).into_owned())
                .collect();
            let reply = self.cluster.answer(&self.address, args);
            if close_after.map_or(true, |limit| answered < limit) {
                self.replies.feed(&encode_value(&reply));
            }
            answered += 1;
        }
        self.closed |= close_after.is_some();
        Ok(())
    }

    fn read_reply(&mut self, timeout: Option<Duration>) -> Result<RespValue> {
        match self.replies.next_reply()? {
            Some(reply) => Ok(reply),
            None if self.closed => Err(ConnectionError::Closed.into()),
            None => Err(timeout_error(timeout)),
        }
    }
}

#[async_trait]
impl AsyncConnection for MockConnection {
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    async fn write_commands(&mut self, commands: &[&Command]) -> Result<()> {
        Connection::write_commands(self, commands)
    }

    async fn read_reply(&mut self, timeout: Option<Duration>) -> Result<RespValue> {
        Connection::read_reply(self, timeout)
    }
}

impl ConnectionPool for MockCluster {
    type Conn = MockConnection;

    fn checkout(&self, node: &NodeAddress, _role: NodeRole) -> Result<MockConnection> {
        self.open(node)
    }

    fn checkin(&self, _conn: MockConnection, healthy: bool) {
        self.release(healthy);
    }
}

#[async_trait]
impl AsyncConnectionPool for MockCluster {
    type Conn = MockConnection;

    async fn checkout(&self, node: &NodeAddress, _role: NodeRole) -> Result<MockConnection> {
        self.open(node)
    }

    fn checkin(&self, _conn: MockConnection, healthy: bool) {
        self.release(healthy);
    }
}

/// Handler that echoes the first key back as a bulk string
pub(crate) fn echo_key(_node: &NodeAddress, args: &[String]) -> RespValue {
    match args.get(1) {
        Some(key) => RespValue::BulkString(key.clone().into_bytes()),
        None => RespValue::SimpleString("PONG".to_string()),
    }
}
