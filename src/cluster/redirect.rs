//! Cluster redirection signals carried in error replies

use super::node::NodeAddress;
use crate::resp::ErrorReply;

/// Routing signal parsed from an error reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirection {
    /// Slot ownership changed permanently
    Moved { slot: u16, node: NodeAddress },
    /// Slot is migrating; retry once on `node` after ASKING
    Ask { slot: u16, node: NodeAddress },
    /// Multi-key operation during resharding; retry later
    TryAgain,
    /// Cluster cannot serve the slot
    ClusterDown(String),
}

impl Redirection {
    /// Classify an error reply. `current` is the node that sent it and fills
    /// in an empty host (`MOVED 3999 :7001`).
    pub fn parse(reply: &ErrorReply, current: &NodeAddress) -> Option<Self> {
        match reply.code.as_str() {
            "MOVED" | "ASK" => {
                let mut parts = reply.message.split_whitespace();
                let slot: u16 = parts.next()?.parse().ok()?;
                if slot as usize >= super::slot_map::SLOT_COUNT {
                    return None;
                }
                let mut node: NodeAddress = parts.next()?.parse().ok()?;
                if node.host.is_empty() {
                    node.host = current.host.clone();
                }
                if reply.code == "MOVED" {
                    Some(Redirection::Moved { slot, node })
                } else {
                    Some(Redirection::Ask { slot, node })
                }
            }
            "TRYAGAIN" => Some(Redirection::TryAgain),
            "CLUSTERDOWN" => Some(Redirection::ClusterDown(reply.to_string())),
            _ => None,
        }
    }
}
