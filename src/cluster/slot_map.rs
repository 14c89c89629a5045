//! Slot ownership snapshot
//!
//! A `SlotMap` is never mutated after construction. Updates (a refresh or a
//! MOVED redirect) build a new map, which the topology manager swaps in.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::node::{ClusterNode, NodeAddress, NodeRole};
use crate::utils::ClusterError;

/// Number of hash slots in a cluster
pub const SLOT_COUNT: usize = 16384;

/// Owner index of a slot no primary serves
const UNASSIGNED: u16 = u16::MAX;

/// CRC16 implementation for cluster slot calculation (XMODEM)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Calculate slot for key using CRC16, honoring `{hash tags}`
pub fn key_slot(key: &[u8]) -> u16 {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(end) = key[start + 1..].iter().position(|&b| b == b'}') {
            if end > 0 {
                return crc16(&key[start + 1..start + 1 + end]) % SLOT_COUNT as u16;
            }
        }
    }
    crc16(key) % SLOT_COUNT as u16
}

/// How much of the keyspace the map can route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    Complete,
    Degraded { unassigned: usize },
}

/// Immutable slot → node snapshot
#[derive(Debug, Clone)]
pub struct SlotMap {
    epoch: u64,
    nodes: Vec<ClusterNode>,
    /// Slot to node index mapping
    owners: Box<[u16]>,
    /// Replica node indices, keyed by primary node index
    replicas: HashMap<u16, Vec<u16>>,
    refreshed_at: Instant,
}

impl SlotMap {
    /// Map with no nodes; every lookup fails
    pub fn empty() -> Self {
        Self {
            epoch: 0,
            nodes: Vec::new(),
            owners: vec![UNASSIGNED; SLOT_COUNT].into_boxed_slice(),
            replicas: HashMap::new(),
            refreshed_at: Instant::now(),
        }
    }

    /// Build a map from parsed nodes
    pub fn from_nodes(nodes: Vec<ClusterNode>) -> Result<Self, ClusterError> {
        if !nodes.iter().any(ClusterNode::is_primary) {
            return Err(ClusterError::NoPrimaries);
        }
        if nodes.len() >= UNASSIGNED as usize {
            return Err(ClusterError::ParseFailed(format!(
                "too many nodes: {}",
                nodes.len()
            )));
        }

        let mut owners = vec![UNASSIGNED; SLOT_COUNT].into_boxed_slice();
        let mut by_id: HashMap<&str, u16> = HashMap::new();

        for (idx, node) in nodes.iter().enumerate() {
            if !node.is_primary() {
                continue;
            }
            by_id.insert(node.id.as_str(), idx as u16);
            for &(start, end) in &node.slots {
                for slot in start..=end {
                    owners[slot as usize] = idx as u16;
                }
            }
        }

        let mut replicas: HashMap<u16, Vec<u16>> = HashMap::new();
        for (idx, node) in nodes.iter().enumerate() {
            if let Some(primary) = node.primary_id.as_deref().and_then(|id| by_id.get(id)) {
                replicas.entry(*primary).or_default().push(idx as u16);
            }
        }

        Ok(Self {
            epoch: 0,
            nodes,
            owners,
            replicas,
            refreshed_at: Instant::now(),
        })
    }

    pub(crate) fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    /// Snapshot version; bumped on every install and every applied MOVED
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    /// Time since this map was built from a full refresh
    pub fn age(&self) -> Duration {
        self.refreshed_at.elapsed()
    }

    /// Owner of `slot`
    pub fn node_for_slot(&self, slot: u16) -> Result<&ClusterNode, ClusterError> {
        match self.owners.get(slot as usize) {
            Some(&idx) if idx != UNASSIGNED => Ok(&self.nodes[idx as usize]),
            _ => Err(ClusterError::SlotNotOwned(slot)),
        }
    }

    /// Replicas of the owner of `slot`, in topology order
    pub fn replicas_for_slot(&self, slot: u16) -> Vec<&ClusterNode> {
        let Some(&owner) = self.owners.get(slot as usize) else {
            return Vec::new();
        };
        self.replicas
            .get(&owner)
            .map(|indices| indices.iter().map(|&idx| &self.nodes[idx as usize]).collect())
            .unwrap_or_default()
    }

    /// Get all primary nodes
    pub fn primaries(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.iter().filter(|n| n.is_primary())
    }

    pub fn node_by_address(&self, address: &NodeAddress) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| &n.address == address)
    }

    pub fn coverage(&self) -> Coverage {
        let unassigned = self.owners.iter().filter(|&&idx| idx == UNASSIGNED).count();
        if unassigned == 0 {
            Coverage::Complete
        } else {
            Coverage::Degraded { unassigned }
        }
    }

    /// Contiguous runs of slots served by the same node, unassigned runs skipped
    pub fn slot_ranges(&self) -> Vec<(u16, u16, &ClusterNode)> {
        let mut ranges = Vec::new();
        let mut slot = 0usize;
        while slot < SLOT_COUNT {
            let owner = self.owners[slot];
            let start = slot;
            while slot + 1 < SLOT_COUNT && self.owners[slot + 1] == owner {
                slot += 1;
            }
            if owner != UNASSIGNED {
                ranges.push((start as u16, slot as u16, &self.nodes[owner as usize]));
            }
            slot += 1;
        }
        ranges
    }

    /// Copy of this map with `slot` reassigned to `address`.
    ///
    /// Returns `None` when `address` already owns the slot. An address the map
    /// does not know is added as a primary; a known replica is promoted.
    pub fn with_moved(&self, slot: u16, address: &NodeAddress) -> Option<SlotMap> {
        if (slot as usize) >= SLOT_COUNT {
            return None;
        }
        if let Ok(owner) = self.node_for_slot(slot) {
            if &owner.address == address {
                return None;
            }
        }

        let mut next = self.clone();
        let idx = match next.nodes.iter().position(|n| &n.address == address) {
            Some(idx) => idx,
            None => {
                if next.nodes.len() >= UNASSIGNED as usize - 1 {
                    return None;
                }
                next.nodes.push(ClusterNode::from_redirect(address.clone()));
                next.nodes.len() - 1
            }
        };

        let node = &mut next.nodes[idx];
        if node.role == NodeRole::Replica {
            node.role = NodeRole::Primary;
            node.primary_id = None;
            let idx = idx as u16;
            for list in next.replicas.values_mut() {
                list.retain(|&r| r != idx);
            }
        }

        next.owners[slot as usize] = idx as u16;
        next.epoch = self.epoch + 1;
        Some(next)
    }
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::empty()
    }
}
