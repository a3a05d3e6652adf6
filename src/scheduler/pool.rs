// src/scheduler/pool.rs
//! Execution slots: a fixed set of named threads that run dispatched ticks.
//!
//! Threads share one job channel. A job that panics is logged and the
//! thread keeps serving; a single misbehaving worker cannot drain the pool.

use crate::error::SchedulerResult;
use log::*;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct ExecutionPool {
    job_tx: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl ExecutionPool {
    /// Spawns `size` threads named "{prefix}-{index}".
    pub(crate) fn new(size: usize, prefix: &str) -> SchedulerResult<Self> {
        let (job_tx, job_rx) = channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut threads = Vec::with_capacity(size);
        for slot in 0..size {
            let job_rx = Arc::clone(&job_rx);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", prefix, slot))
                .spawn(move || Self::slot_loop(slot, job_rx))?;
            threads.push(handle);
        }

        info!("ExecutionPool: {} slots started", size);
        Ok(Self {
            job_tx: Some(job_tx),
            threads,
        })
    }

    fn slot_loop(slot: usize, job_rx: Arc<Mutex<Receiver<Job>>>) {
        trace!("ExecutionPool: slot {} started", slot);
        loop {
            // hold the receiver lock only while waiting, not while running
            let job = match job_rx.lock() {
                Ok(rx) => rx.recv(),
                Err(_) => break,
            };
            match job {
                Ok(job) => {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("ExecutionPool: job panicked on slot {}", slot);
                    }
                }
                Err(_) => break,
            }
        }
        trace!("ExecutionPool: slot {} exiting", slot);
    }

    /// Queues a job. Returns false once the pool has been shut down.
    pub(crate) fn submit(&self, job: Job) -> bool {
        match &self.job_tx {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.threads.len()
    }

    /// Closes the queue and joins every slot. Queued jobs still run.
    pub(crate) fn shutdown(&mut self) {
        if self.job_tx.take().is_none() {
            return;
        }
        for handle in self.threads.drain(..) {
            if let Err(e) = handle.join() {
                error!("ExecutionPool: slot thread panicked: {:?}", e);
            }
        }
        info!("ExecutionPool: shut down");
    }
}

impl Drop for ExecutionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
