//! Topology discovery
//!
//! Parses CLUSTER NODES replies into slot maps and drives the refresh
//! candidate sequence. Nothing here performs I/O; the blocking and async
//! clients run the same [`RefreshAttempt`] against their own connections.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::node::{parse_cluster_node_line, NodeAddress};
use super::slot_map::{Coverage, SlotMap};
use crate::resp::RespValue;
use crate::utils::{ClientError, ClusterError};

/// Rewrites announced node addresses to ones reachable from this client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostTranslation {
    exact: HashMap<NodeAddress, NodeAddress>,
    hosts: HashMap<String, String>,
}

impl HostTranslation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `host:port=host:port` and `host=host` rules
    pub fn from_rules<I, S>(rules: I) -> Result<Self, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut translation = Self::new();
        for rule in rules {
            translation.add_rule(rule.as_ref())?;
        }
        Ok(translation)
    }

    pub fn add_rule(&mut self, rule: &str) -> Result<(), ClientError> {
        let (from, to) = rule
            .split_once('=')
            .ok_or_else(|| ClientError::Config(format!("remap rule '{}' needs FROM=TO", rule)))?;
        let (from, to) = (from.trim(), to.trim());
        if from.is_empty() || to.is_empty() {
            return Err(ClientError::Config(format!("empty side in remap rule '{}'", rule)));
        }

        match (from.parse::<NodeAddress>(), to.parse::<NodeAddress>()) {
            (Ok(from), Ok(to)) => {
                self.exact.insert(from, to);
            }
            (Err(_), Err(_)) => {
                self.hosts.insert(from.to_string(), to.to_string());
            }
            _ => {
                return Err(ClientError::Config(format!(
                    "remap rule '{}' mixes an address with a bare host",
                    rule
                )))
            }
        }
        Ok(())
    }

    pub fn map_address(&mut self, from: NodeAddress, to: NodeAddress) -> &mut Self {
        self.exact.insert(from, to);
        self
    }

    pub fn map_host(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.hosts.insert(from.into(), to.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.hosts.is_empty()
    }

    /// Exact address rules win over host-only rules
    pub fn translate(&self, address: &NodeAddress) -> NodeAddress {
        if let Some(to) = self.exact.get(address) {
            return to.clone();
        }
        match self.hosts.get(&address.host) {
            Some(host) => NodeAddress::new(host.clone(), address.port),
            None => address.clone(),
        }
    }
}

/// Build a slot map from a CLUSTER NODES reply received from `source`.
///
/// An empty host (a node that has not learned its own IP yet) is replaced by
/// the host that was queried. Translation is applied afterwards.
pub fn parse_cluster_nodes(
    text: &str,
    source: &NodeAddress,
    translation: &HostTranslation,
) -> Result<SlotMap, ClusterError> {
    let mut nodes = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut node = parse_cluster_node_line(line)?;
        if node.address.host.is_empty() {
            node.address.host = source.host.clone();
        }
        node.address = translation.translate(&node.address);
        nodes.push(node);
    }

    if nodes.is_empty() {
        return Err(ClusterError::ParseFailed(
            "empty CLUSTER NODES reply".to_string(),
        ));
    }
    SlotMap::from_nodes(nodes)
}

/// Extract the CLUSTER NODES text payload
pub fn cluster_nodes_text(reply: &RespValue) -> Result<&str, ClusterError> {
    match reply {
        RespValue::Attribute { value, .. } => cluster_nodes_text(value),
        RespValue::Error(e) => Err(ClusterError::ParseFailed(format!(
            "CLUSTER NODES failed: {}",
            e
        ))),
        other => other.as_str().ok_or_else(|| {
            ClusterError::ParseFailed(format!(
                "CLUSTER NODES returned {} instead of a string",
                other.kind()
            ))
        }),
    }
}

/// One pass over the refresh candidates.
///
/// Candidates are the configured seeds followed by the primaries of the
/// current map, without duplicates. The driver asks for the next candidate,
/// queries it, and reports back until a map is produced or candidates run out.
/// With a deadline, the walk also stops once the deadline has passed.
#[derive(Debug)]
pub struct RefreshAttempt {
    candidates: Vec<NodeAddress>,
    next: usize,
    failures: Vec<String>,
    deadline: Option<Instant>,
}

impl RefreshAttempt {
    pub fn new(seeds: &[NodeAddress], current: &SlotMap) -> Self {
        let mut candidates: Vec<NodeAddress> = Vec::new();
        let known = seeds
            .iter()
            .cloned()
            .chain(current.primaries().map(|n| n.address.clone()));
        for address in known {
            if !candidates.contains(&address) {
                candidates.push(address);
            }
        }
        Self {
            candidates,
            next: 0,
            failures: Vec::new(),
            deadline: None,
        }
    }

    /// Stop handing out candidates once `deadline` has passed
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn candidates(&self) -> &[NodeAddress] {
        &self.candidates
    }

    pub fn next_candidate(&mut self) -> Option<NodeAddress> {
        if self.next < self.candidates.len() && self.expired() {
            warn!(
                "Topology refresh deadline passed with {} candidates left",
                self.candidates.len() - self.next
            );
            self.failures.push("deadline passed before refresh finished".to_string());
            self.next = self.candidates.len();
            return None;
        }
        let candidate = self.candidates.get(self.next).cloned();
        if candidate.is_some() {
            self.next += 1;
        }
        candidate
    }

    /// Read timeout for the next fetch: `request_timeout`, cut to what is
    /// left before the deadline
    pub fn fetch_timeout(&self, request_timeout: Duration) -> Duration {
        match self.deadline {
            Some(deadline) => {
                request_timeout.min(deadline.saturating_duration_since(Instant::now()))
            }
            None => request_timeout,
        }
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Parse the reply from `from`; a parse failure moves on to the next candidate
    pub fn on_reply(
        &mut self,
        from: &NodeAddress,
        reply: &RespValue,
        translation: &HostTranslation,
    ) -> Option<SlotMap> {
        let parsed = cluster_nodes_text(reply)
            .and_then(|text| parse_cluster_nodes(text, from, translation));
        match parsed {
            Ok(map) => {
                if let Coverage::Degraded { unassigned } = map.coverage() {
                    warn!(
                        "Topology from {} leaves {} slots unassigned",
                        from, unassigned
                    );
                }
                debug!("Fetched topology from {}: {} nodes", from, map.nodes().len());
                Some(map)
            }
            Err(e) => {
                self.record(from, &e);
                None
            }
        }
    }

    /// Connection or I/O failure for `from`
    pub fn on_error(&mut self, from: &NodeAddress, err: &ClientError) {
        self.record(from, err);
    }

    fn record(&mut self, from: &NodeAddress, err: &dyn std::fmt::Display) {
        warn!("Failed to fetch topology from {}: {}", from, err);
        self.failures.push(format!("{}: {}", from, err));
    }

    /// Terminal error once every candidate has failed
    pub fn into_error(self) -> ClusterError {
        if self.candidates.is_empty() {
            return ClusterError::TopologyUnavailable("no seed nodes configured".to_string());
        }
        ClusterError::TopologyUnavailable(self.failures.join("; "))
    }
}
