//! Parity between in-network computing and the naive fallback.
//!
//! With in-network computing disabled the switches degrade to pure
//! routing and every collective is rebuilt from point-to-point exchanges.
//! The endpoint-visible results must not change.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use fattree_sim::network::endpoint::EndpointTask;
use fattree_sim::{Fabric, ReduceOp, Topology};

const ENDPOINTS: usize = 16;

type Outcomes = Arc<Mutex<Vec<Option<Vec<f32>>>>>;

/// Run the mixed collective workload and return what every endpoint saw.
fn run_workload(network_computing: bool) -> Result<Vec<Option<Vec<f32>>>> {
    let outcomes: Outcomes = Arc::new(Mutex::new(vec![None; ENDPOINTS]));

    let topology = Topology::new(4)?;
    let mut fabric = Fabric::build(topology, network_computing, |id| -> EndpointTask {
        let outcomes = Arc::clone(&outcomes);
        Box::new(move |mpi| {
            // Broadcast a seed, fold a per-endpoint vector everywhere, then
            // scatter and gather a permutation through root 2.
            let mut seed = if id == 5 { vec![0.5] } else { Vec::new() };
            mpi.broadcast(&mut seed, 5)?;

            let mut folded = vec![id as f32 + seed[0], 1.0];
            mpi.reduce_all(&mut folded, ReduceOp::Sum)?;

            mpi.barrier()?;

            let mut slice = if id == 2 {
                (0..ENDPOINTS).rev().map(|value| value as f32).collect()
            } else {
                Vec::new()
            };
            mpi.scatter(&mut slice, 2)?;

            let mut gathered = slice.clone();
            mpi.gather(&mut gathered, 2)?;

            // Every endpoint reports its local view of the run.
            let mut outcome = folded;
            outcome.extend(&slice);
            if id == 2 {
                outcome.extend(&gathered);
            }

            outcomes.lock().unwrap()[id] = Some(outcome);
            Ok(())
        })
    })?;

    fabric.run(1_000_000)?;

    let outcomes = outcomes.lock().unwrap();
    Ok(outcomes.clone())
}

#[test]
fn disabling_network_computing_preserves_results() -> Result<()> {
    let with_computing = run_workload(true)?;
    let without_computing = run_workload(false)?;

    for id in 0..ENDPOINTS {
        assert_eq!(
            with_computing[id], without_computing[id],
            "endpoint {id} diverged between the two modes"
        );
        assert!(with_computing[id].is_some());
    }

    Ok(())
}

#[test]
fn naive_results_are_correct_in_absolute_terms() -> Result<()> {
    let outcomes = run_workload(false)?;

    // Sum over id of (id + 0.5) is 120 + 8, and the count column is 16.
    let folded_expected = vec![128.0, 16.0];
    for id in 0..ENDPOINTS {
        let outcome = outcomes[id].as_ref().expect("endpoint produced no outcome");
        assert_eq!(&outcome[..2], &folded_expected[..]);

        // The scatter slice of endpoint j is the reversed sequence at j.
        assert_eq!(outcome[2], (ENDPOINTS - 1 - id) as f32);
    }

    // Root 2 additionally restored its full reversed vector.
    let root = outcomes[2].as_ref().expect("root produced no outcome");
    let reversed: Vec<f32> = (0..ENDPOINTS).rev().map(|value| value as f32).collect();
    assert_eq!(&root[3..], &reversed[..]);

    Ok(())
}
