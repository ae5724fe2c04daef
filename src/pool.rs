//! Fixed-size worker pool for blocking handler execution
//!
//! Jobs are plain blocking closures fed through a crossbeam channel to a fixed
//! set of named threads. The pool size doubles as backpressure: once every
//! worker is busy, further jobs wait in the queue. A panicking job is contained
//! to that job; the worker thread survives.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    ShutDown,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Pending {
    fn increment(&self) {
        *self.count.lock() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_zero(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.drained.wait(&mut count);
        }
    }
}

pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    pending: Arc<Pending>,
}

impl WorkerPool {
    /// Spawns `size` workers; a size of zero is raised to one.
    pub fn new(size: usize) -> Result<Self, PoolError> {
        let size = size.max(1);
        let (sender, receiver) = unbounded::<Job>();
        let pending = Arc::new(Pending::default());

        let workers = (0..size)
            .map(|index| {
                let receiver = receiver.clone();
                let pending = pending.clone();
                thread::Builder::new()
                    .name(format!("mcp-worker-{index}"))
                    .spawn(move || worker_loop(index, receiver, pending))
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(workers = size, "worker pool started");
        Ok(Self {
            sender: Some(sender),
            workers,
            pending,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn execute<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(PoolError::ShutDown)?;
        self.pending.increment();
        if sender.send(Box::new(job)).is_err() {
            self.pending.decrement();
            return Err(PoolError::ShutDown);
        }
        Ok(())
    }

    /// Number of jobs queued or running.
    pub fn pending(&self) -> usize {
        *self.pending.count.lock()
    }

    /// Blocks until every submitted job has finished.
    pub fn wait_idle(&self) {
        self.pending.wait_zero();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // closing the channel lets workers drain the queue and exit
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("worker thread terminated abnormally");
            }
        }
    }
}

fn worker_loop(index: usize, receiver: Receiver<Job>, pending: Arc<Pending>) {
    while let Ok(job) = receiver.recv() {
        trace!(worker = index, "job started");
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            error!(
                worker = index,
                panic = %panic_message(payload.as_ref()),
                "job panicked"
            );
        }
        pending.decrement();
    }
    debug!(worker = index, "worker stopped");
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
