//! End-to-end collective correctness on a complete 4-port fat-tree.
//!
//! Every test builds the full 16-endpoint network, runs one collective
//! through the real switch engines and verifies the endpoint-visible
//! results.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use fattree_sim::network::endpoint::EndpointTask;
use fattree_sim::{Fabric, ReduceOp, Topology};

const ENDPOINTS: usize = 16;
const TICK_BUDGET: u64 = 100_000;

/// Build a k=4 fabric, run every endpoint's task to completion and return
/// the tick count.
fn run_fabric<F>(task_for: F) -> Result<u64>
where
    F: FnMut(usize) -> EndpointTask,
{
    let topology = Topology::new(4)?;
    let mut fabric = Fabric::build(topology, true, task_for)?;
    Ok(fabric.run(TICK_BUDGET)?)
}

/// Shared per-endpoint result collector.
type Results = Arc<Mutex<Vec<Option<Vec<f32>>>>>;

fn results() -> Results {
    Arc::new(Mutex::new(vec![None; ENDPOINTS]))
}

fn record(results: &Results, id: usize, data: Vec<f32>) {
    results.lock().unwrap()[id] = Some(data);
}

#[test]
fn direct_send_delivers_payload_within_budget() -> Result<()> {
    let received = results();

    let ticks = run_fabric(|id| {
        let received = Arc::clone(&received);
        Box::new(move |mpi| {
            match id {
                0 => mpi.send(&[1.0, 2.0], 7)?,
                7 => {
                    let mut data = Vec::new();
                    mpi.receive(&mut data, 0)?;
                    record(&received, id, data);
                }
                _ => {}
            }
            Ok(())
        })
    })?;

    assert_eq!(
        received.lock().unwrap()[7],
        Some(vec![1.0, 2.0]),
        "endpoint 7 must observe the exact payload"
    );
    // One request and one acknowledgement across at most five hops each.
    assert!(ticks < 200, "direct exchange took {ticks} ticks");
    Ok(())
}

#[test]
fn broadcast_reaches_every_other_endpoint_once() -> Result<()> {
    let received = results();

    run_fabric(|id| {
        let received = Arc::clone(&received);
        Box::new(move |mpi| {
            let mut data = if id == 3 { vec![42.0] } else { Vec::new() };
            mpi.broadcast(&mut data, 3)?;
            record(&received, id, data);
            Ok(())
        })
    })?;

    let received = received.lock().unwrap();
    for id in 0..ENDPOINTS {
        assert_eq!(
            received[id],
            Some(vec![42.0]),
            "endpoint {id} observed the wrong broadcast payload"
        );
    }
    Ok(())
}

#[test]
fn barrier_holds_until_every_endpoint_entered() -> Result<()> {
    let entered_first = Arc::new(AtomicUsize::new(0));
    let entered_second = Arc::new(AtomicUsize::new(0));
    let seen_first = Arc::new(Mutex::new(Vec::new()));
    let seen_second = Arc::new(Mutex::new(Vec::new()));

    run_fabric(|_id| {
        let entered_first = Arc::clone(&entered_first);
        let entered_second = Arc::clone(&entered_second);
        let seen_first = Arc::clone(&seen_first);
        let seen_second = Arc::clone(&seen_second);
        Box::new(move |mpi| {
            entered_first.fetch_add(1, Ordering::SeqCst);
            mpi.barrier()?;
            seen_first
                .lock()
                .unwrap()
                .push(entered_first.load(Ordering::SeqCst));

            // The flags must reset cleanly for an immediate second cycle.
            entered_second.fetch_add(1, Ordering::SeqCst);
            mpi.barrier()?;
            seen_second
                .lock()
                .unwrap()
                .push(entered_second.load(Ordering::SeqCst));
            Ok(())
        })
    })?;

    // Whoever returns from a barrier must have observed every entry into it.
    for seen in seen_first.lock().unwrap().iter() {
        assert_eq!(*seen, ENDPOINTS, "first barrier released early");
    }
    for seen in seen_second.lock().unwrap().iter() {
        assert_eq!(*seen, ENDPOINTS, "second barrier released early");
    }

    Ok(())
}

#[test]
fn reduce_sum_folds_every_contribution_at_the_root() -> Result<()> {
    let received = results();

    run_fabric(|id| {
        let received = Arc::clone(&received);
        Box::new(move |mpi| {
            let mut data = vec![id as f32, id as f32 * 10.0];
            mpi.reduce(&mut data, ReduceOp::Sum, 5)?;
            if id == 5 {
                record(&received, id, data);
            }
            Ok(())
        })
    })?;

    // Sum over 0..16 is 120.
    assert_eq!(received.lock().unwrap()[5], Some(vec![120.0, 1200.0]));
    Ok(())
}

#[test]
fn reduce_all_max_yields_the_same_result_everywhere() -> Result<()> {
    let received = results();
    let expected = (0..ENDPOINTS)
        .map(|id| (id as f32).sin())
        .fold(f32::MIN, f32::max);

    run_fabric(|id| {
        let received = Arc::clone(&received);
        Box::new(move |mpi| {
            let mut data = vec![(id as f32).sin()];
            mpi.reduce_all(&mut data, ReduceOp::Max)?;
            record(&received, id, data);
            Ok(())
        })
    })?;

    let received = received.lock().unwrap();
    for id in 0..ENDPOINTS {
        assert_eq!(
            received[id],
            Some(vec![expected]),
            "endpoint {id} observed a different reduce-all result"
        );
    }
    Ok(())
}

#[test]
fn scatter_then_gather_restores_the_root_vector() -> Result<()> {
    let slices = results();
    let restored = results();

    run_fabric(|id| {
        let slices = Arc::clone(&slices);
        let restored = Arc::clone(&restored);
        Box::new(move |mpi| {
            let mut data = if id == 0 {
                (0..ENDPOINTS).map(|value| value as f32).collect()
            } else {
                Vec::new()
            };

            mpi.scatter(&mut data, 0)?;
            record(&slices, id, data.clone());

            mpi.gather(&mut data, 0)?;
            if id == 0 {
                record(&restored, id, data);
            }
            Ok(())
        })
    })?;

    let slices = slices.lock().unwrap();
    for id in 0..ENDPOINTS {
        assert_eq!(
            slices[id],
            Some(vec![id as f32]),
            "endpoint {id} received the wrong scatter slice"
        );
    }

    let expected: Vec<f32> = (0..ENDPOINTS).map(|value| value as f32).collect();
    assert_eq!(restored.lock().unwrap()[0], Some(expected));
    Ok(())
}

#[test]
fn all_gather_concatenates_in_endpoint_order() -> Result<()> {
    let received = results();

    run_fabric(|id| {
        let received = Arc::clone(&received);
        Box::new(move |mpi| {
            let mut data = vec![id as f32];
            mpi.all_gather(&mut data)?;
            record(&received, id, data);
            Ok(())
        })
    })?;

    let expected: Vec<f32> = (0..ENDPOINTS).map(|value| value as f32).collect();
    let received = received.lock().unwrap();
    for id in 0..ENDPOINTS {
        assert_eq!(
            received[id],
            Some(expected.clone()),
            "endpoint {id} observed an out-of-order all-gather result"
        );
    }
    Ok(())
}

#[test]
fn collectives_compose_back_to_back() -> Result<()> {
    let received = results();

    run_fabric(|id| {
        let received = Arc::clone(&received);
        Box::new(move |mpi| {
            // Broadcast, then reduce the broadcast payload, then a barrier.
            let mut data = if id == 0 { vec![2.0, 3.0] } else { Vec::new() };
            mpi.broadcast(&mut data, 0)?;

            mpi.reduce(&mut data, ReduceOp::Sum, 1)?;
            mpi.barrier()?;

            if id == 1 {
                record(&received, id, data);
            }
            Ok(())
        })
    })?;

    let scaled = ENDPOINTS as f32;
    assert_eq!(
        received.lock().unwrap()[1],
        Some(vec![2.0 * scaled, 3.0 * scaled])
    );
    Ok(())
}
