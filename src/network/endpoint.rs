//! # Compute Endpoints
//!
//! An endpoint binds one [`Mpi`] interface to a user task. The task runs on
//! a dedicated worker thread, spawned lazily at the first tick, and issues
//! blocking interface calls while the driver keeps advancing the endpoint's
//! port. Once the task returns the endpoint reports itself done; the
//! simulation ends when every endpoint does.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{error, trace};

use crate::error::SimError;
use crate::network::message::EndpointId;
use crate::network::mpi::Mpi;
use crate::network::port::{PortArena, PortId};
use crate::topology::Topology;

/// The work an endpoint performs over its interface.
pub type EndpointTask = Box<dyn FnOnce(&Mpi) -> Result<(), SimError> + Send + 'static>;

pub struct Endpoint {
    id: EndpointId,
    mpi: Arc<Mpi>,
    port: PortId,
    task: Option<EndpointTask>,
    worker: Option<JoinHandle<()>>,
    done: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
}

impl Endpoint {
    pub fn new(
        id: EndpointId,
        topology: Topology,
        compute_enabled: bool,
        arena: &mut PortArena,
        task: EndpointTask,
    ) -> Self {
        trace!("created endpoint {id}");

        Self {
            id,
            mpi: Arc::new(Mpi::new(id, topology, compute_enabled)),
            port: arena.alloc(),
            task: Some(task),
            worker: None,
            done: Arc::new(AtomicBool::new(false)),
            failed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn mpi(&self) -> &Mpi {
        &self.mpi
    }

    pub fn is_ready(&self, arena: &PortArena) -> bool {
        arena.is_connected(self.port)
    }

    /// True once the task returned. A failed task also counts as done so
    /// the driver loop can terminate; the failure is reported separately.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Advance the endpoint by one tick. The first tick starts the worker.
    pub fn tick(&mut self, arena: &mut PortArena) -> Result<(), SimError> {
        if let Some(task) = self.task.take() {
            let mpi = Arc::clone(&self.mpi);
            let done = Arc::clone(&self.done);
            let failed = Arc::clone(&self.failed);
            let id = self.id;

            self.worker = Some(std::thread::spawn(move || {
                trace!("endpoint {id}: task started");

                // A panicking task must still flip the done flag, or the
                // driver loop would spin until its tick budget runs out.
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task(&mpi)));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        error!("endpoint {id}: task failed: {err}");
                        failed.store(true, Ordering::Release);
                    }
                    Err(_) => {
                        error!("endpoint {id}: task panicked");
                        failed.store(true, Ordering::Release);
                    }
                }

                done.store(true, Ordering::Release);
                trace!("endpoint {id}: task finished");
            }));
        }

        self.mpi.tick(arena, self.port)
    }

    /// Join the worker thread after the task reported done.
    pub fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("endpoint {}: worker thread panicked", self.id);
                self.failed.store(true, Ordering::Release);
            }
        }
    }
}
