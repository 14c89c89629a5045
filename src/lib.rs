//! valkey-cluster-client library
//!
//! RESP2/RESP3 codec, slot map and redirect-aware routing for Valkey and
//! Redis clusters, with blocking and tokio drivers.

pub mod client;
pub mod cluster;
pub mod command;
pub mod config;
pub mod resp;
pub mod utils;

#[cfg(test)]
mod testing;

pub use client::{AsyncClusterClient, ClusterClient};
pub use command::Command;
pub use config::{ClusterConfig, ReadFrom};
pub use resp::RespValue;
pub use utils::{ClientError, Result};
