//! Cluster node representation

use std::fmt;
use std::str::FromStr;

use crate::utils::ClusterError;

/// Reachable `host:port` of a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for NodeAddress {
    type Err = ClusterError;

    /// Accepts `host:port`, `[v6]:port` and `:port` (empty host)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ClusterError::ParseFailed(format!("missing port in '{}'", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ClusterError::ParseFailed(format!("invalid port in '{}'", s)))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        Ok(Self::new(host, port))
    }
}

/// Node role within its shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Primary,
    Replica,
}

/// Cluster bus link state as reported by CLUSTER NODES
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// Cluster node information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    /// Node ID from CLUSTER NODES (empty for nodes learned from a redirect)
    pub id: String,
    pub address: NodeAddress,
    /// Cluster bus port
    pub bus_port: u16,
    /// Announced hostname (`ip:port@cport,hostname`)
    pub hostname: Option<String>,
    pub role: NodeRole,
    /// Primary node ID (if replica)
    pub primary_id: Option<String>,
    /// Inclusive slot ranges served (primaries only)
    pub slots: Vec<(u16, u16)>,
    /// Node flags (myself, fail, handshake, etc.)
    pub flags: Vec<String>,
    pub link: LinkState,
}

impl ClusterNode {
    /// Primary that is only known from a MOVED redirect
    pub fn from_redirect(address: NodeAddress) -> Self {
        Self {
            id: String::new(),
            address,
            bus_port: 0,
            hostname: None,
            role: NodeRole::Primary,
            primary_id: None,
            slots: Vec::new(),
            flags: Vec::new(),
            link: LinkState::Connected,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.role == NodeRole::Primary
    }

    pub fn is_replica(&self) -> bool {
        self.role == NodeRole::Replica
    }

    /// Whether this line described the node that answered CLUSTER NODES
    pub fn is_myself(&self) -> bool {
        self.has_flag("myself")
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// Check if node is available
    pub fn is_available(&self) -> bool {
        self.link == LinkState::Connected
            && !self
                .flags
                .iter()
                .any(|f| matches!(f.as_str(), "fail" | "fail?" | "handshake" | "noaddr"))
    }

    /// Number of slots this node serves
    pub fn slot_count(&self) -> usize {
        self.slots
            .iter()
            .map(|&(start, end)| (end - start) as usize + 1)
            .sum()
    }
}

/// Parse a line from CLUSTER NODES response
///
/// Format: `<id> <ip:port@cport> <flags> <master> <ping-sent> <pong-recv> <config-epoch> <link-state> <slot> <slot> ... <slot>`
///
/// Example:
/// ```text
/// 07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
/// ```
pub fn parse_cluster_node_line(line: &str) -> Result<ClusterNode, ClusterError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 8 {
        return Err(ClusterError::ParseFailed(format!(
            "expected at least 8 fields, got {}: '{}'",
            parts.len(),
            line
        )));
    }

    let id = parts[0].to_string();
    let (address, bus_port, hostname) = parse_node_address(parts[1])?;

    let flags: Vec<String> = parts[2].split(',').map(String::from).collect();
    let role = if flags.iter().any(|f| f == "slave" || f == "replica") {
        NodeRole::Replica
    } else {
        NodeRole::Primary
    };

    let primary_id = match (role, parts[3]) {
        (NodeRole::Replica, id) if id != "-" => Some(id.to_string()),
        _ => None,
    };

    let link = match parts[7] {
        "connected" => LinkState::Connected,
        _ => LinkState::Disconnected,
    };

    let mut slots = Vec::new();
    if role == NodeRole::Primary {
        for &slot_str in &parts[8..] {
            if let Some(range) = parse_slot_range(slot_str)? {
                slots.push(range);
            }
        }
    }

    Ok(ClusterNode {
        id,
        address,
        bus_port,
        hostname,
        role,
        primary_id,
        slots,
        flags,
        link,
    })
}

/// Parse node address from CLUSTER NODES
/// Formats: "host:port@cport", "host:port", "host:port@cport,hostname", ":port@cport"
fn parse_node_address(addr: &str) -> Result<(NodeAddress, u16, Option<String>), ClusterError> {
    let (addr, hostname) = match addr.split_once(',') {
        Some((addr, hostname)) if !hostname.is_empty() => (addr, Some(hostname.to_string())),
        Some((addr, _)) => (addr, None),
        None => (addr, None),
    };

    let (host_port, bus_port) = match addr.split_once('@') {
        Some((hp, bus)) => (hp, bus.parse().unwrap_or(0)),
        None => (addr, 0),
    };

    let address = host_port.parse()?;
    Ok((address, bus_port, hostname))
}

/// Parse slot range: "0-5460" or "0"
///
/// Migration markers such as `[93->-id]` and `[93-<-id]` yield `None`.
fn parse_slot_range(s: &str) -> Result<Option<(u16, u16)>, ClusterError> {
    if s.starts_with('[') {
        return Ok(None);
    }

    let invalid = || ClusterError::ParseFailed(format!("invalid slot range '{}'", s));
    let (start, end) = match s.split_once('-') {
        Some((start, end)) => (
            start.parse::<u16>().map_err(|_| invalid())?,
            end.parse::<u16>().map_err(|_| invalid())?,
        ),
        None => {
            let slot = s.parse::<u16>().map_err(|_| invalid())?;
            (slot, slot)
        }
    };

    if start > end || end as usize >= super::slot_map::SLOT_COUNT {
        return Err(invalid());
    }
    Ok(Some((start, end)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_primary_node() {
        let line = "07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30001@31001 myself,master - 0 1426238316232 1 connected 0-5460";
        let node = parse_cluster_node_line(line).unwrap();

        assert_eq!(node.id, "07c37dfeb235213a872192d90877d0cd55635b91");
        assert_eq!(node.address, NodeAddress::new("127.0.0.1", 30001));
        assert_eq!(node.bus_port, 31001);
        assert!(node.is_primary());
        assert!(node.is_myself());
        assert!(node.is_available());
        assert_eq!(node.slots, vec![(0, 5460)]);
        assert_eq!(node.slot_count(), 5461);
    }

    #[test]
    fn test_parse_replica_node() {
        let line = "07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected";
        let node = parse_cluster_node_line(line).unwrap();

        assert!(node.is_replica());
        assert_eq!(
            node.primary_id,
            Some("e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca".to_string())
        );
        assert!(node.slots.is_empty());
    }

    #[test]
    fn test_parse_multiple_ranges_and_markers() {
        let line = "abc 10.0.0.1:7000@17000 master - 0 0 1 connected 0-10 12 [13->-def] [14-<-ghi] 20-30";
        let node = parse_cluster_node_line(line).unwrap();
        assert_eq!(node.slots, vec![(0, 10), (12, 12), (20, 30)]);
    }

    #[test]
    fn test_failed_node_unavailable() {
        for flags in ["master,fail", "master,fail?", "master,handshake", "master,noaddr"] {
            let line = format!("abc 10.0.0.1:7000@17000 {} - 0 0 1 connected", flags);
            assert!(!parse_cluster_node_line(&line).unwrap().is_available(), "{}", flags);
        }
        let line = "abc 10.0.0.1:7000@17000 master - 0 0 1 disconnected";
        assert!(!parse_cluster_node_line(line).unwrap().is_available());
    }

    #[test]
    fn test_parse_rejects_short_and_bad_lines() {
        assert!(parse_cluster_node_line("abc 127.0.0.1:7000 master").is_err());
        assert!(parse_cluster_node_line("abc 127.0.0.1 master - 0 0 1 connected").is_err());
        assert!(parse_cluster_node_line("abc 127.0.0.1:7000 master - 0 0 1 connected 0-16384").is_err());
        assert!(parse_cluster_node_line("abc 127.0.0.1:7000 master - 0 0 1 connected 9-3").is_err());
    }

    #[test]
    fn test_parse_node_address() {
        let (addr, bus, hostname) = parse_node_address("127.0.0.1:6379@16379").unwrap();
        assert_eq!(addr, NodeAddress::new("127.0.0.1", 6379));
        assert_eq!(bus, 16379);
        assert!(hostname.is_none());
    }

    #[test]
    fn test_parse_node_address_no_bus_port() {
        let (addr, bus, _) = parse_node_address("127.0.0.1:6379").unwrap();
        assert_eq!(addr, NodeAddress::new("127.0.0.1", 6379));
        assert_eq!(bus, 0);
    }

    #[test]
    fn test_parse_address_with_hostname() {
        let (addr, bus, hostname) =
            parse_node_address("10.0.0.1:6379@16379,hostname.example.com").unwrap();
        assert_eq!(addr, NodeAddress::new("10.0.0.1", 6379));
        assert_eq!(bus, 16379);
        assert_eq!(hostname.as_deref(), Some("hostname.example.com"));
    }

    #[test]
    fn test_parse_empty_host() {
        let (addr, _, _) = parse_node_address(":7001@17001").unwrap();
        assert_eq!(addr, NodeAddress::new("", 7001));
    }

    #[test]
    fn test_node_address_display_and_parse() {
        let v4: NodeAddress = "10.1.2.3:7000".parse().unwrap();
        assert_eq!(v4.to_string(), "10.1.2.3:7000");

        let v6: NodeAddress = "[::1]:7000".parse().unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "[::1]:7000");

        assert!("nohost".parse::<NodeAddress>().is_err());
        assert!("host:99999".parse::<NodeAddress>().is_err());
    }

    #[test]
    fn test_parse_slot_range() {
        assert_eq!(parse_slot_range("0-5460").unwrap(), Some((0, 5460)));
        assert_eq!(parse_slot_range("5461").unwrap(), Some((5461, 5461)));
        assert_eq!(parse_slot_range("[123->-abc]").unwrap(), None);
        assert!(parse_slot_range("x").is_err());
    }
}
