//! Cluster topology and routing
//!
//! This module provides cluster support including:
//! - Slot mapping and CRC16 calculation
//! - Topology discovery via CLUSTER NODES
//! - Host translation for NAT and container deployments
//! - MOVED/ASK/TRYAGAIN/CLUSTERDOWN handling
//! - Read-from-replica node selection
//! - Per-node pipeline batching

pub mod node;
pub mod pipeline;
pub mod redirect;
pub mod router;
pub mod slot_map;
pub mod topology;
pub mod topology_manager;

pub use node::{ClusterNode, LinkState, NodeAddress, NodeRole};
pub use pipeline::{Batch, BatchOutcome, Followup, Pipeline};
pub use redirect::Redirection;
pub use router::{Dispatch, RetryPolicy, RouteState, Router, Step};
pub use slot_map::{crc16, key_slot, Coverage, SlotMap, SLOT_COUNT};
pub use topology::{parse_cluster_nodes, HostTranslation, RefreshAttempt};
pub use topology_manager::{DueRefresh, RefreshGuard, TopologyManager};
