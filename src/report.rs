//! # Run Report
//!
//! A machine-readable summary of one simulation run, written as JSON when
//! the user passes `--output-file`. It records the topology, whether the
//! in-switch engines were active, how many ticks the run took and the
//! per-endpoint message totals.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cli::SimConfig;
use crate::error::SimError;
use crate::network::mpi::MpiStats;

#[derive(Debug, Serialize)]
pub struct RunReport {
    /// Wall-clock timestamp of report creation.
    pub timestamp: DateTime<Utc>,

    /// Simulator version that produced the report.
    pub version: String,

    pub ports_per_switch: usize,
    pub core_switches: usize,
    pub aggregate_switches: usize,
    pub edge_switches: usize,
    pub endpoints: usize,

    pub network_computing: bool,

    /// Virtual time the run took.
    pub ticks: u64,

    /// Message totals per endpoint, in id order.
    pub endpoint_stats: Vec<MpiStats>,
}

impl RunReport {
    pub fn new(config: &SimConfig, ticks: u64, endpoint_stats: Vec<MpiStats>) -> Self {
        let topology = &config.topology;

        Self {
            timestamp: Utc::now(),
            version: crate::VERSION.to_string(),
            ports_per_switch: topology.ports_per_switch(),
            core_switches: topology.core_switches(),
            aggregate_switches: topology.aggregate_switches(),
            edge_switches: topology.edge_switches(),
            endpoints: topology.endpoints(),
            network_computing: config.network_computing,
            ticks,
            endpoint_stats,
        }
    }

    /// Total messages sent by all endpoints.
    pub fn total_messages(&self) -> u64 {
        self.endpoint_stats
            .iter()
            .map(|stats| stats.messages_sent)
            .sum()
    }

    /// Write the report as pretty-printed JSON.
    pub fn write_json(&self, path: &Path) -> Result<(), SimError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|err| SimError::Report(format!("cannot serialize report: {err}")))?;

        let mut file = File::create(path)
            .map_err(|err| SimError::Report(format!("cannot create {}: {err}", path.display())))?;
        file.write_all(json.as_bytes())
            .map_err(|err| SimError::Report(format!("cannot write {}: {err}", path.display())))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Args, SimConfig};
    use clap::Parser;

    fn sample_report() -> RunReport {
        let args = Args::parse_from(["fattree-sim"]);
        let config = SimConfig::from_args(&args).unwrap();
        RunReport::new(
            &config,
            321,
            vec![MpiStats {
                endpoint: 0,
                messages_sent: 7,
                messages_received: 5,
            }],
        )
    }

    #[test]
    fn report_reflects_topology() {
        let report = sample_report();

        assert_eq!(report.ports_per_switch, 4);
        assert_eq!(report.endpoints, 16);
        assert_eq!(report.ticks, 321);
        assert_eq!(report.total_messages(), 7);
    }

    #[test]
    fn report_round_trips_through_disk() {
        let report = sample_report();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        report.write_json(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["ticks"], 321);
        assert_eq!(value["endpoints"], 16);
        assert_eq!(value["endpoint_stats"][0]["messages_sent"], 7);
    }
}
