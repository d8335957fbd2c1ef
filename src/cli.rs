//! # Command-Line Interface Module
//!
//! This module provides command-line argument parsing and configuration
//! management for the simulator. It uses the `clap` crate's derive API to
//! provide a user-friendly interface while maintaining type safety and
//! validation.
//!
//! ## Usage Examples
//!
//! ```bash
//! # Simulate the default 4-port fat-tree
//! fattree-sim
//!
//! # A 6-port tree with verbose diagnostics on stderr
//! fattree-sim --ports 6 -vv --log-file stderr
//!
//! # Disable in-network computing and write a JSON run report
//! fattree-sim --network-computing false --output-file run.json
//! ```
//!
//! ## Argument Categories
//!
//! - **Topology**: `--ports` is the sole topology parameter; every switch
//!   and endpoint count derives from it
//! - **Behavior**: `--network-computing` toggles the in-switch collective
//!   engines, `--max-ticks` bounds stalled runs
//! - **Output and Logging**: verbosity, quiet mode, log and report files

use clap::builder::styling::{AnsiColor, Styles};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;

use crate::error::SimError;
use crate::topology::Topology;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Ports per switch (even, at least 4)
    ///
    /// The single topology parameter. A value of k produces k²/4 core
    /// switches, k²/2 aggregate and edge switches and k³/4 endpoints.
    #[arg(long, default_value_t = crate::defaults::PORTS_PER_SWITCH, help_heading = "Topology")]
    pub ports: usize,

    /// Enable in-network computing
    ///
    /// When enabled, switches fold collective contributions as they pass
    /// through. When disabled, switches degrade to pure routing and the
    /// endpoints fall back to a naive point-to-point protocol that yields
    /// the same results.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, help_heading = "Behavior")]
    pub network_computing: bool,

    /// Abort the run after this many ticks without completion
    ///
    /// A safety net that turns a stalled simulation into an error instead
    /// of an endless loop.
    #[arg(long, default_value_t = crate::defaults::MAX_TICKS, help_heading = "Behavior")]
    pub max_ticks: u64,

    /// Silence all user-facing informational output on stdout
    ///
    /// When this flag is present, only diagnostic logs will be emitted.
    /// This is useful for scripting or when piping results to another
    /// program.
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity.
    ///
    /// Can be used multiple times to increase detail:
    ///  -v: debug
    ///  -vv and more: trace
    /// By default, only INFO and above are shown.
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// Detailed log destination ("stderr" or a file path)
    ///
    /// By default detailed logs go to a daily-rotated file in the working
    /// directory.
    #[arg(long, help_heading = "Output and Logging")]
    pub log_file: Option<String>,

    /// Optional JSON run report
    ///
    /// When given, a summary of the run (topology, tick count, per-endpoint
    /// message totals) is written to this path.
    #[arg(short = 'o', long, help_heading = "Output and Logging")]
    pub output_file: Option<PathBuf>,
}

/// Validated configuration for one simulation run.
///
/// Derived from [`Args`]; construction fails on an invalid port count so
/// every later stage can rely on a well-formed topology.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct SimConfig {
    /// The validated fat-tree topology.
    pub topology: Topology,

    /// Whether the in-switch collective engines are active.
    pub network_computing: bool,

    /// Upper bound on simulation ticks.
    pub max_ticks: u64,
}

impl SimConfig {
    /// Validate CLI arguments into a run configuration.
    pub fn from_args(args: &Args) -> Result<Self, SimError> {
        Ok(Self {
            topology: Topology::new(args.ports)?,
            network_computing: args.network_computing,
            max_ticks: args.max_ticks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from(["fattree-sim"])
    }

    #[test]
    fn default_configuration_is_valid() {
        let config = SimConfig::from_args(&base_args()).unwrap();

        assert_eq!(config.topology.ports_per_switch(), 4);
        assert!(config.network_computing);
        assert_eq!(config.max_ticks, crate::defaults::MAX_TICKS);
    }

    #[test]
    fn odd_port_count_is_rejected() {
        let mut args = base_args();
        args.ports = 5;
        assert!(SimConfig::from_args(&args).is_err());
    }

    #[test]
    fn too_small_port_count_is_rejected() {
        let mut args = base_args();
        args.ports = 2;
        assert!(SimConfig::from_args(&args).is_err());
    }

    #[test]
    fn network_computing_flag_parses_explicit_values() {
        let args = Args::parse_from(["fattree-sim", "--network-computing", "false"]);
        assert!(!args.network_computing);

        let args = Args::parse_from(["fattree-sim", "--network-computing", "true"]);
        assert!(args.network_computing);
    }
}
