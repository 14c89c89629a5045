//! Command-line argument parsing
//!
//! Connection flags follow valkey-cli (`-h`, `-p`); the rest tune the
//! cluster router.

use clap::{Parser, ValueEnum};

use super::cluster_config::ReadFrom;

/// Cluster-aware command-line client for Valkey
#[derive(Parser, Debug, Clone)]
#[command(name = "valkey-cluster-cli")]
#[command(version, about, long_about = None)]
#[command(disable_help_flag = true)]
#[command(trailing_var_arg = true)]
#[allow(clippy::manual_non_exhaustive)]
pub struct CliArgs {
    /// Print help information
    #[arg(long = "help", action = clap::ArgAction::Help)]
    help: (),

    /// Command to run; starts an interactive prompt when empty
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command_args: Vec<String>,

    // ===== Connection Options =====
    /// Seed node, `host` or `host:port` (can be specified multiple times)
    #[arg(short = 'h', long = "host", default_value = "127.0.0.1", action = clap::ArgAction::Append)]
    pub hosts: Vec<String>,

    /// Port for seeds given without one
    #[arg(short = 'p', long = "port", default_value_t = 6379)]
    pub port: u16,

    /// Connection timeout in milliseconds
    #[arg(long = "connect-timeout", default_value_t = 2000)]
    pub connect_timeout_ms: u64,

    /// Per-reply timeout in milliseconds
    #[arg(long = "request-timeout", default_value_t = 5000)]
    pub request_timeout_ms: u64,

    /// Overall per-command deadline in milliseconds, retries included
    #[arg(long = "overall-timeout", default_value_t = 10000)]
    pub overall_timeout_ms: u64,

    // ===== Cluster Options =====
    /// Read from replicas strategy
    #[arg(long = "rfr", value_enum, default_value_t = ReadFrom::Primary)]
    pub read_from: ReadFrom,

    /// Maximum dispatches per command
    #[arg(long = "max-attempts", default_value_t = 16)]
    pub max_attempts: u32,

    /// Maximum MOVED/ASK hops per command
    #[arg(long = "max-redirects", default_value_t = 5)]
    pub max_redirects: u32,

    /// Refresh the slot map periodically (seconds)
    #[arg(long = "refresh-interval")]
    pub refresh_interval_secs: Option<u64>,

    /// Rewrite announced node addresses, FROM=TO (host or host:port)
    #[arg(long = "remap", action = clap::ArgAction::Append)]
    pub remap: Vec<String>,

    /// Print the slot map and exit
    #[arg(long = "topology")]
    pub topology: bool,

    // ===== Output Options =====
    /// Output format
    #[arg(long = "output-format", value_enum, default_value_t = OutputFormat::Text)]
    pub output_format: OutputFormat,

    /// Quiet mode (errors only)
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Output format for replies
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate argument combinations
    pub fn validate(&self) -> Result<(), String> {
        if self.quiet && self.verbose {
            return Err("--quiet and --verbose are mutually exclusive".to_string());
        }
        if self.max_attempts == 0 {
            return Err("--max-attempts must be at least 1".to_string());
        }
        if self.topology && !self.command_args.is_empty() {
            return Err("--topology does not take a command".to_string());
        }
        if self.request_timeout_ms == 0 || self.overall_timeout_ms == 0 {
            return Err("timeouts must be non-zero".to_string());
        }
        Ok(())
    }
}
