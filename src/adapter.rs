//! Transfer adapter abstraction and the shared worker-pool runtime.
//!
//! Concrete strategies implement [`TransferImpl`], a single-object transfer
//! function. [`AdapterBase`] turns that into a [`TransferAdapter`]: it runs a
//! fixed number of worker threads pulling from a bounded job queue, publishes
//! one [`TransferResult`] per job and holds every worker but the first behind
//! an [`AuthGate`] until the first job has settled authentication.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crate::gate::{AuthGate, AuthSignal, GateHold};
use crate::progress::ProgressCallback;
use crate::{Error, ObjectRef, Result};

/// Jobs that may sit in the queue before `add` blocks.
const JOB_QUEUE_CAPACITY: usize = 100;

/// Time assumed to pass between the expiry check and the actual transfer.
const OBJECT_EXPIRATION_TO_TRANSFER: Duration = Duration::from_secs(5);

/// Which way an adapter moves content. An adapter instance is bound to one
/// direction for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Send local content to the remote store.
    Upload,
    /// Fetch remote content into the local store.
    Download,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one submitted object, produced exactly once per `add`.
#[derive(Debug)]
pub struct TransferResult {
    pub object: ObjectRef,
    /// `None` when the object is now present at / was read from its path.
    pub error: Option<Error>,
}

impl TransferResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// A direction-bound strategy for moving a batch of objects.
///
/// Call [`begin`](TransferAdapter::begin), then [`add`](TransferAdapter::add)
/// for each object, then [`end`](TransferAdapter::end), which blocks until
/// every queued object has produced a result.
pub trait TransferAdapter: Send {
    /// Name shared by all instances of this kind of adapter.
    fn name(&self) -> &str;

    fn direction(&self) -> Direction;

    /// Start a batch with up to `max_concurrency` parallel transfers.
    ///
    /// Results go to `completion`; the sender is dropped once `end` returns,
    /// which closes the queue for the receiver.
    fn begin(
        &mut self,
        max_concurrency: usize,
        progress: Option<ProgressCallback>,
        completion: Option<Sender<TransferResult>>,
    ) -> Result<()>;

    /// Queue an object. Blocks while the job queue is full.
    fn add(&self, object: ObjectRef) -> Result<()>;

    /// Wait for all queued objects and stop the workers.
    fn end(&mut self);

    /// Remove temporary data, such as partial downloads that would
    /// otherwise be resumed.
    fn clear_temp_storage(&self) -> Result<()>;
}

/// Single-object transfer function run by the worker pool.
///
/// It is called from several threads at once, but never for the same object
/// in parallel. Implementations must signal `auth` as soon as they know
/// authentication succeeded, before the payload is moved.
pub trait TransferImpl: Send + Sync + 'static {
    /// Per-worker state created by [`worker_starting`](TransferImpl::worker_starting).
    type Context: Send + 'static;

    /// Number of workers to run for a requested concurrency.
    fn worker_count(&self, max_concurrency: usize) -> usize {
        max_concurrency
    }

    /// Called on the `begin` thread for each worker before it starts.
    fn worker_starting(&self, worker: usize) -> Result<Self::Context>;

    /// Called on the worker thread once its queue is drained.
    fn worker_ending(&self, _worker: usize, _ctx: Self::Context) {}

    fn do_transfer(
        &self,
        ctx: &mut Self::Context,
        object: &ObjectRef,
        progress: Option<&ProgressCallback>,
        auth: &mut AuthSignal<'_>,
    ) -> Result<()>;

    fn clear_temp_storage(&self) -> Result<()> {
        Ok(())
    }
}

/// Generic worker-pool adapter around a [`TransferImpl`].
pub struct AdapterBase<T: TransferImpl> {
    name: String,
    direction: Direction,
    imp: Arc<T>,
    running: Option<Running>,
}

struct Running {
    jobs: Sender<ObjectRef>,
    workers: Vec<JoinHandle<()>>,
    completion: Option<Sender<TransferResult>>,
}

struct Worker<T: TransferImpl> {
    num: usize,
    adapter: String,
    imp: Arc<T>,
    gate: Arc<AuthGate>,
    jobs: Receiver<ObjectRef>,
    progress: Option<ProgressCallback>,
    completion: Option<Sender<TransferResult>>,
}

impl<T: TransferImpl> AdapterBase<T> {
    pub fn new(name: &str, direction: Direction, imp: T) -> Self {
        AdapterBase {
            name: name.to_string(),
            direction,
            imp: Arc::new(imp),
            running: None,
        }
    }

    /// The wrapped strategy.
    pub fn implementation(&self) -> &T {
        &self.imp
    }
}

impl<T: TransferImpl> TransferAdapter for AdapterBase<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn begin(
        &mut self,
        max_concurrency: usize,
        progress: Option<ProgressCallback>,
        completion: Option<Sender<TransferResult>>,
    ) -> Result<()> {
        if self.running.is_some() {
            self.end();
        }
        let count = self.imp.worker_count(max_concurrency).max(1);
        tracing::debug!("xfer: adapter {:?} Begin() with {} workers", self.name, count);

        let (jobs_tx, jobs_rx) = bounded(JOB_QUEUE_CAPACITY);
        let gate = Arc::new(AuthGate::new());
        let mut running = Running {
            jobs: jobs_tx,
            workers: Vec::with_capacity(count),
            completion,
        };

        for num in 0..count {
            let ctx = match self.imp.worker_starting(num) {
                Ok(ctx) => ctx,
                Err(e) => {
                    tracing::debug!("xfer: adapter {:?} worker {} failed to start: {}", self.name, num, e);
                    // Let the workers already running drain and exit
                    gate.release();
                    running.stop();
                    return Err(e);
                }
            };
            let worker = Worker {
                num,
                adapter: self.name.clone(),
                imp: self.imp.clone(),
                gate: gate.clone(),
                jobs: jobs_rx.clone(),
                progress: progress.clone(),
                completion: running.completion.clone(),
            };
            let spawned = thread::Builder::new()
                .name(format!("lfs-{}-{}", self.name, num))
                .spawn(move || worker.run(ctx));
            match spawned {
                Ok(handle) => running.workers.push(handle),
                Err(e) => {
                    gate.release();
                    running.stop();
                    return Err(e.into());
                }
            }
        }

        self.running = Some(running);
        tracing::debug!("xfer: adapter {:?} started", self.name);
        Ok(())
    }

    fn add(&self, object: ObjectRef) -> Result<()> {
        let running = self
            .running
            .as_ref()
            .ok_or_else(|| Error::AdapterNotStarted(self.name.clone()))?;
        tracing::trace!("xfer: adapter {:?} Add() for {}", self.name, object.oid());
        running
            .jobs
            .send(object)
            .map_err(|_| Error::AdapterNotStarted(self.name.clone()))
    }

    fn end(&mut self) {
        tracing::debug!("xfer: adapter {:?} End()", self.name);
        if let Some(running) = self.running.take() {
            running.stop();
        }
        tracing::debug!("xfer: adapter {:?} stopped", self.name);
    }

    fn clear_temp_storage(&self) -> Result<()> {
        self.imp.clear_temp_storage()
    }
}

impl<T: TransferImpl> Drop for AdapterBase<T> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop();
        }
    }
}

impl Running {
    /// Close the job queue, join every worker, then drop our completion
    /// sender so the receiver sees the queue close.
    fn stop(self) {
        let Running {
            jobs,
            workers,
            completion,
        } = self;
        drop(jobs);
        for handle in workers {
            if handle.join().is_err() {
                tracing::warn!("xfer: transfer worker panicked");
            }
        }
        drop(completion);
    }
}

impl<T: TransferImpl> Worker<T> {
    fn run(self, mut ctx: T::Context) {
        let num = self.num;
        tracing::trace!("xfer: adapter {:?} worker {} starting", self.adapter, num);

        // Worker 0 is the only one allowed to start immediately; the rest
        // wait until the first job settles authentication so that at most
        // one login prompt is shown.
        if num > 0 {
            tracing::trace!("xfer: adapter {:?} worker {} waiting for auth", self.adapter, num);
            self.gate.wait();
            tracing::trace!("xfer: adapter {:?} worker {} auth signal received", self.adapter, num);
        }
        let mut hold = if num == 0 {
            GateHold::new(&self.gate)
        } else {
            GateHold::none()
        };

        for object in self.jobs.iter() {
            tracing::trace!("xfer: adapter {:?} worker {} processing job for {}", self.adapter, num, object.oid());

            let mut auth = match hold.gate() {
                Some(gate) => AuthSignal::armed(gate),
                None => AuthSignal::inert(),
            };
            let result = self.transfer(&mut ctx, &object, &mut auth);

            // A failed first job must not stall the other workers forever.
            hold.release();

            if let Err(e) = &result {
                tracing::debug!("xfer: adapter {:?} worker {} job for {} failed: {}", self.adapter, num, object.oid(), e);
            }
            if let Some(completion) = &self.completion {
                let _ = completion.send(TransferResult {
                    object,
                    error: result.err(),
                });
            }
        }

        // Still held only if no jobs were submitted.
        hold.release();
        tracing::trace!("xfer: adapter {:?} worker {} stopping", self.adapter, num);
        self.imp.worker_ending(num, ctx);
    }

    fn transfer(&self, ctx: &mut T::Context, object: &ObjectRef, auth: &mut AuthSignal<'_>) -> Result<()> {
        let transfer_time = SystemTime::now() + OBJECT_EXPIRATION_TO_TRANSFER;
        if let Some(link) = object.link() {
            if link.expired_at(transfer_time).is_some() {
                tracing::debug!("xfer: adapter {:?} worker {} found job for {} expired", self.adapter, self.num, object.oid());
                return Err(Error::retriable(Error::Http(format!(
                    "object {} link has expired",
                    object.oid()
                ))));
            }
        }
        self.imp.do_transfer(ctx, object, self.progress.as_ref(), auth)
    }
}
