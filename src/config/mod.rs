//! Configuration module

pub mod cli;
pub mod cluster_config;

pub use cli::{CliArgs, OutputFormat};
pub use cluster_config::{ClusterConfig, ReadFrom};
