//! # Fat-Tree Simulator - Main Entry Point
//!
//! The binary wires a complete k-ary fat-tree from the `--ports` parameter
//! and runs a distributed matrix-multiplication workload over the blocking
//! message-passing interface of every endpoint:
//!
//! 1. Endpoint 0 builds two square matrices and scatters matrix A by rows
//! 2. Matrix B is broadcast to everyone, followed by a barrier
//! 3. Each endpoint multiplies its row block locally
//! 4. The result rows are gathered back at endpoint 0, and a final barrier
//!    closes the run
//!
//! The simulation driver thread advances the network tick by tick while
//! the endpoint tasks block inside their interface calls.
//!
//! ## Error Handling
//!
//! Configuration and wiring problems surface before the first tick and
//! exit nonzero. A protocol violation inside a switch aborts the run with
//! the offending switch identified.

use anyhow::Result;
use clap::Parser;
use fattree_sim::{
    cli::{Args, SimConfig},
    network::endpoint::EndpointTask,
    Fabric, RunReport,
};
use tracing::{debug, error, info};

use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

mod logging;
use logging::ColorizedFormatter;

fn main() -> Result<()> {
    // Parse command-line arguments first, as they control logging behavior.
    let args = Args::parse();

    // Diagnostic verbosity for both the log file and stdout:
    // - default: INFO
    // - -v: DEBUG
    // - -vv and more: TRACE
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Configure the detailed log layer (file or stderr). The guard must be
    // kept alive for the duration of the program for file logging.
    let guard;
    let detailed_log_layer;

    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("fattree_sim.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "fattree_sim.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false) // Disable color codes for the file logger
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    // Clean, user-facing output on stdout unless --quiet is present.
    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    let _log_guard = guard;

    info!("starting fat-tree simulation");

    let config = SimConfig::from_args(&args)?;
    let topology = config.topology;

    if config.network_computing {
        info!("in-network computing is enabled");
    } else {
        info!("in-network computing is disabled, collectives fall back to point-to-point");
    }

    info!(
        "topology: {} ports per switch, {} core, {} aggregate, {} edge switches, {} endpoints",
        topology.ports_per_switch(),
        topology.core_switches(),
        topology.aggregate_switches(),
        topology.edge_switches(),
        topology.endpoints()
    );

    let mut fabric = Fabric::build(topology, config.network_computing, |id| {
        matrix_multiply_task(id, topology.endpoints())
    })?;

    let ticks = match fabric.run(config.max_ticks) {
        Ok(ticks) => ticks,
        Err(err) => {
            error!("simulation failed: {err}");
            return Err(err.into());
        }
    };

    let report = RunReport::new(&config, ticks, fabric.endpoint_stats());
    info!(
        "simulation finished after {ticks} ticks, {} messages sent in total",
        report.total_messages()
    );

    if let Some(path) = args.output_file.as_deref() {
        report.write_json(path)?;
        info!("run report written to {}", path.display());
    }

    Ok(())
}

/// The demo workload: a row-distributed multiplication of two n-by-n
/// matrices, where n is the endpoint count.
///
/// Endpoint 0 owns both input matrices. Rows of A are scattered so each
/// endpoint computes one row of the product against the broadcast B, and
/// the rows are gathered back at endpoint 0.
fn matrix_multiply_task(id: usize, n: usize) -> EndpointTask {
    Box::new(move |mpi| {
        let mut matrix_a = Vec::new();
        let mut matrix_b = Vec::new();

        if id == 0 {
            matrix_a = (0..n * n)
                .map(|index| ((index / n) + (index % n)) as f32)
                .collect();
            matrix_b = (0..n * n)
                .map(|index| ((index / n) as isize - (index % n) as isize) as f32)
                .collect();
        }

        mpi.scatter(&mut matrix_a, 0)?;
        mpi.broadcast(&mut matrix_b, 0)?;
        mpi.barrier()?;

        // matrix_a now holds this endpoint's row of A.
        let mut local_row = vec![0.0f32; n];
        for (column, cell) in local_row.iter_mut().enumerate() {
            let mut sum = 0.0f32;
            for index in 0..n {
                sum += matrix_a[index] * matrix_b[index * n + column];
            }
            *cell = sum;
        }

        mpi.gather(&mut local_row, 0)?;
        mpi.barrier()?;

        if id == 0 {
            let rows: Vec<String> = local_row
                .chunks(n)
                .map(|row| {
                    row.iter()
                        .map(|value| format!("{value:6.0}"))
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect();
            debug!("result matrix:\n{}", rows.join("\n"));
        }

        Ok(())
    })
}
