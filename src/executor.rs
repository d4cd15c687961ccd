//! Dedicated worker threads for blocking channel work
//!
//! A [`WorkerPool`] runs each of its workers on its own named thread, calling
//! [`Worker::execute`] in a loop until the pool is stopped. Threads are
//! created with a configured stack size and pinned to a CPU mask, so blocking
//! network calls stay off the real-time cores.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;
use tracing::{debug, debug_span, error, warn};

use crate::utils::{get_default_stack_size, get_default_stop_timeout};

/// A unit of work that is executed repeatedly on a dedicated thread
pub trait Worker: Send + 'static {
    /// Run one iteration. Must return in bounded time for the pool to stop.
    fn execute(&mut self);
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Base name for the worker threads
    pub name: String,
    /// Affinity mask; bit N selects CPU N. All bits set leaves affinity alone.
    pub cpus: u64,
    pub stack_size: usize,
    /// How long to wait for workers each time the pool is asked to stop
    pub stop_timeout: Duration,
}

impl WorkerSettings {
    pub fn new(name: &str) -> Self {
        WorkerSettings {
            name: name.to_string(),
            cpus: u64::MAX,
            stack_size: get_default_stack_size(),
            stop_timeout: get_default_stop_timeout(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to start worker thread {name}: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },
    #[error("{name}: {pending} workers did not stop")]
    StopFailed { name: String, pending: usize },
    #[error("worker thread {name} panicked")]
    Panicked { name: String },
}

/// Sends the index of a worker when its thread exits, including by panic
struct ExitNotice {
    index: usize,
    sender: Sender<usize>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.sender.send(self.index);
    }
}

/// A set of running workers
pub struct WorkerPool<W: Worker> {
    name: String,
    stop: Arc<AtomicBool>,
    handles: Vec<(String, JoinHandle<W>)>,
    exits: Receiver<usize>,
    stop_timeout: Duration,
}

impl<W: Worker> WorkerPool<W> {
    /// Start one thread per worker
    pub fn start(settings: &WorkerSettings, workers: Vec<W>) -> Result<Self, PoolError> {
        let (exit_tx, exits) = crossbeam_channel::unbounded();
        let mut pool = WorkerPool {
            name: settings.name.clone(),
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::with_capacity(workers.len()),
            exits,
            stop_timeout: settings.stop_timeout,
        };
        for (index, mut worker) in workers.into_iter().enumerate() {
            let thread_name = format!("{}{index}", settings.name);
            let stop = pool.stop.clone();
            let notice = ExitNotice {
                index,
                sender: exit_tx.clone(),
            };
            let cpus = settings.cpus;
            let span_name = thread_name.clone();
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .stack_size(settings.stack_size)
                .spawn(move || {
                    let _notice = notice;
                    let _span = debug_span!("worker", name = %span_name).entered();
                    if let Err(e) = apply_affinity(cpus) {
                        warn!("Could not set CPU affinity {cpus:#x}: {e}");
                    }
                    debug!("Worker started");
                    while !stop.load(Ordering::Acquire) {
                        worker.execute();
                    }
                    debug!("Worker stopping");
                    worker
                })
                .map_err(|source| PoolError::Spawn {
                    name: thread_name.clone(),
                    source,
                })?;
            pool.handles.push((thread_name, handle));
        }
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop every worker and hand them back
    ///
    /// Waits for the configured stop timeout, then once more, before giving up
    /// with [`PoolError::StopFailed`].
    pub fn stop(mut self) -> Result<Vec<W>, PoolError> {
        self.stop.store(true, Ordering::Release);
        let mut pending = self.handles.len();
        for attempt in 0..2 {
            pending = self.wait_for_exits(pending);
            if pending == 0 {
                break;
            }
            if attempt == 0 {
                warn!("{}: {pending} workers still running, retrying stop", self.name);
            }
        }
        if pending > 0 {
            error!("{}: {pending} workers failed to stop", self.name);
            return Err(PoolError::StopFailed {
                name: self.name.clone(),
                pending,
            });
        }
        let mut workers = Vec::with_capacity(self.handles.len());
        for (name, handle) in std::mem::take(&mut self.handles) {
            match handle.join() {
                Ok(worker) => workers.push(worker),
                Err(_) => {
                    error!("{name}: Worker panicked");
                    return Err(PoolError::Panicked { name });
                }
            }
        }
        Ok(workers)
    }

    /// Wait up to the stop timeout for `pending` workers to exit. Returns how many remain.
    fn wait_for_exits(&self, mut pending: usize) -> usize {
        let deadline = Instant::now() + self.stop_timeout;
        while pending > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.exits.recv_timeout(left) {
                Ok(index) => {
                    debug!("{}: Worker {index} exited", self.name);
                    pending -= 1;
                }
                Err(_) => break,
            }
        }
        pending
    }
}

impl<W: Worker> Drop for WorkerPool<W> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// Pin the calling thread to the CPUs selected by a mask
#[cfg(target_os = "linux")]
fn apply_affinity(cpus: u64) -> Result<(), String> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    if cpus == u64::MAX {
        return Ok(());
    }
    let mut cpuset = CpuSet::new();
    for cpu in (0..64usize).filter(|c| cpus & (1u64 << c) != 0) {
        cpuset
            .set(cpu)
            .map_err(|e| format!("CpuSet::set({cpu}) failed: {e}"))?;
    }
    sched_setaffinity(Pid::from_raw(0), &cpuset)
        .map_err(|e| format!("sched_setaffinity failed: {e}"))
}

#[cfg(not(target_os = "linux"))]
fn apply_affinity(_cpus: u64) -> Result<(), String> {
    Ok(())
}
