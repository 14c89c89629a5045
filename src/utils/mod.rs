//! Utility modules

pub mod error;

pub use error::{ClientError, ClusterError, ConnectionError, ProtocolError, Result};
