//! Blocking TCP connections and the per-node pool

use std::collections::HashMap;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::connection::{Connection, ConnectionExt, ConnectionPool, PushSink, RespConnection};
use crate::cluster::{NodeAddress, NodeRole};
use crate::command::Command;
use crate::config::ClusterConfig;
use crate::resp::RespValue;
use crate::utils::{ConnectionError, Result};

/// Open a TCP connection with Nagle disabled
pub fn connect_tcp(address: &NodeAddress, connect_timeout: Duration) -> Result<TcpStream> {
    let connect_failed = |source: io::Error| ConnectionError::ConnectFailed {
        host: address.host.clone(),
        port: address.port,
        source,
    };

    // Resolve hostname to socket addresses; try each in turn
    let addrs = (address.host.as_str(), address.port)
        .to_socket_addrs()
        .map_err(connect_failed)?;

    let mut last_error = io::Error::new(io::ErrorKind::NotFound, "No addresses found");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, connect_timeout) {
            Ok(stream) => {
                stream.set_nodelay(true).ok(); // Disable Nagle's algorithm
                return Ok(stream);
            }
            Err(e) => last_error = e,
        }
    }
    Err(connect_failed(last_error).into())
}

/// Connection factory for creating connections with common config
#[derive(Clone)]
pub struct ConnectionFactory {
    pub connect_timeout: Duration,
    /// Bound on the READONLY handshake for replica connections
    pub setup_timeout: Duration,
    pub push_sink: Option<PushSink>,
}

impl ConnectionFactory {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            setup_timeout: config.request_timeout,
            push_sink: None,
        }
    }

    /// Create a new connection to `address`
    pub fn create(&self, address: &NodeAddress, role: NodeRole) -> Result<PooledConnection> {
        let stream = connect_tcp(address, self.connect_timeout)?;
        let mut conn = RespConnection::new(stream, address.clone())
            .with_push_sink(self.push_sink.clone());

        if role == NodeRole::Replica {
            conn.readonly(Some(self.setup_timeout))?;
        }
        debug!("Opened {:?} connection to {}", role, address);

        Ok(PooledConnection { conn, role })
    }
}

/// TCP connection tagged with the role it was opened for
pub struct PooledConnection {
    conn: RespConnection<TcpStream>,
    role: NodeRole,
}

impl PooledConnection {
    pub fn role(&self) -> NodeRole {
        self.role
    }
}

impl Connection for PooledConnection {
    fn address(&self) -> &NodeAddress {
        self.conn.address()
    }

    fn write_commands(&mut self, commands: &[&Command]) -> Result<()> {
        self.conn.write_commands(commands)
    }

    fn read_reply(&mut self, timeout: Option<Duration>) -> Result<RespValue> {
        self.conn.read_reply(timeout)
    }
}

/// Idle connection lists per node and role
pub struct NodePool {
    factory: ConnectionFactory,
    idle: Mutex<HashMap<(NodeAddress, NodeRole), Vec<PooledConnection>>>,
    max_idle_per_node: usize,
}

impl NodePool {
    pub fn new(factory: ConnectionFactory, max_idle_per_node: usize) -> Self {
        Self {
            factory,
            idle: Mutex::new(HashMap::new()),
            max_idle_per_node,
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(ConnectionFactory::from_config(config), config.max_idle_per_node)
    }

    pub fn with_push_sink(mut self, sink: PushSink) -> Self {
        self.factory.push_sink = Some(sink);
        self
    }

    /// Idle connections currently held for `node`
    pub fn idle_count(&self, node: &NodeAddress) -> usize {
        self.idle
            .lock()
            .iter()
            .filter(|((address, _), _)| address == node)
            .map(|(_, conns)| conns.len())
            .sum()
    }
}

impl ConnectionPool for NodePool {
    type Conn = PooledConnection;

    fn checkout(&self, node: &NodeAddress, role: NodeRole) -> Result<PooledConnection> {
        let idle = self
            .idle
            .lock()
            .get_mut(&(node.clone(), role))
            .and_then(|conns| conns.pop());
        match idle {
            Some(conn) => Ok(conn),
            None => self.factory.create(node, role),
        }
    }

    fn checkin(&self, conn: PooledConnection, healthy: bool) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn factory() -> ConnectionFactory {
        ConnectionFactory {
            connect_timeout: Duration::from_secs(2),
            setup_timeout: Duration::from_secs(2),
            push_sink: None,
        }
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let result = connect_tcp(&NodeAddress::new("127.0.0.1", port), Duration::from_secs(1));
        assert!(matches!(
            result,
            Err(crate::utils::ClientError::Connection(
                ConnectionError::ConnectFailed { .. }
            ))
        ));
    }

    #[test]
    fn test_replica_connection_sends_readonly() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let expected = b"*1\r\n$8\r\nREADONLY\r\n";
            let mut buf = vec![0u8; expected.len()];
            peer.read_exact(&mut buf).unwrap();
            assert_eq!(buf, expected);
            peer.write_all(b"+OK\r\n").unwrap();
        });

        let conn = factory()
            .create(&NodeAddress::new("127.0.0.1", port), NodeRole::Replica)
            .unwrap();
        assert_eq!(conn.role(), NodeRole::Replica);
        server.join().unwrap();
    }

    #[test]
    fn test_pool_reuses_healthy_and_drops_unhealthy() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let mut peers = Vec::new();
            for _ in 0..2 {
                peers.push(listener.accept().unwrap().0);
            }
            peers
        });

        let node = NodeAddress::new("127.0.0.1", port);
        let pool = NodePool::new(factory(), 1);

        let first = pool.checkout(&node, NodeRole::Primary).unwrap();
        pool.checkin(first, true);
        assert_eq!(pool.idle_count(&node), 1);

        let reused = pool.checkout(&node, NodeRole::Primary).unwrap();
        assert_eq!(pool.idle_count(&node), 0);
        pool.checkin(reused, false);
        assert_eq!(pool.idle_count(&node), 0);

        let fresh = pool.checkout(&node, NodeRole::Primary).unwrap();
        pool.checkin(fresh, true);
        assert_eq!(pool.idle_count(&node), 1);

        assert_eq!(server.join().unwrap().len(), 2);
    }

    #[test]
    #[ignore]
    fn test_ping_live_server() {
        let mut conn = factory()
            .create(&NodeAddress::new("127.0.0.1", 6379), NodeRole::Primary)
            .expect("Failed to connect");
        assert!(conn.ping(Some(Duration::from_secs(1))).expect("Ping failed"));
    }
}
