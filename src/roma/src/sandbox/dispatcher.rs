//! Queues load/execute requests across the worker pool.
//!
//! Submission returns immediately with accepted/rejected; a per-worker
//! consumer thread owns the IPC round trip and invokes the completion
//! callback when the worker answers. Loads fan out to every worker (each
//! worker must learn every code version); invocations go to an idle worker
//! when one exists, else behind the shortest local queue.
//!
//! Per-worker ordering is free: one consumer per worker means invocations
//! submitted to a worker complete in submission order, and a load enqueued
//! before an invocation is acknowledged before that invocation runs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use roma_common::{CodeSpec, ExecuteSpec};
use tracing::instrument;

use super::worker::WorkerSandbox;
use crate::error::{Result, RomaError};
use crate::metrics::{
    METRIC_INVOCATIONS, METRIC_PENDING_REQUESTS, METRIC_QUEUE_FULL_REJECTIONS,
    METRIC_WORKER_REPLACEMENTS,
};
use crate::objects::ResponseObject;

/// How the host learns the outcome of an accepted request. Runs on the
/// consumer thread of the worker that served the request; it must not block
/// indefinitely, or it throttles that worker.
pub type CompletionCallback = Box<dyn FnOnce(Result<ResponseObject>) + Send + 'static>;

/// Attempts to bring a replacement worker up before its slot goes dark.
const RESPAWN_ATTEMPTS: u32 = 3;

enum Job {
    Load {
        spec: CodeSpec,
        fan_in: Arc<LoadFanIn>,
    },
    Invoke {
        spec: ExecuteSpec,
        callback: CompletionCallback,
    },
    Stop,
}

/// Collects per-worker load acks into one host completion.
struct LoadFanIn {
    code_id: String,
    remaining: AtomicUsize,
    failure: Mutex<Option<RomaError>>,
    callback: Mutex<Option<CompletionCallback>>,
    pending: Arc<AtomicUsize>,
}

impl LoadFanIn {
    fn complete(&self, result: Result<()>) {
        if let Err(err) = result {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        // Last worker answered: settle the host callback.
        self.pending.fetch_sub(1, Ordering::AcqRel);
        metrics::gauge!(METRIC_PENDING_REQUESTS).decrement(1);
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            let outcome = match self.failure.lock().take() {
                Some(err) => Err(err),
                None => Ok(ResponseObject {
                    id: self.code_id.clone(),
                    ..Default::default()
                }),
            };
            callback(outcome);
        }
    }
}

struct WorkerSlot {
    tx: Sender<Job>,
    queued: Arc<AtomicUsize>,
    busy: Arc<AtomicBool>,
}

/// Owns the worker pool and schedules requests onto it.
pub struct Dispatcher {
    slots: Vec<WorkerSlot>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    stopping: Arc<AtomicBool>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    loaded: Arc<Mutex<Vec<CodeSpec>>>,
}

impl Dispatcher {
    /// Take ownership of a pool of initialized workers.
    ///
    /// Workers must already have completed their init handshake; the
    /// dispatcher starts one consumer thread per worker.
    pub fn new(workers: Vec<WorkerSandbox>, max_pending_requests: usize) -> Self {
        let pending = Arc::new(AtomicUsize::new(0));
        let stopping = Arc::new(AtomicBool::new(false));
        let loaded = Arc::new(Mutex::new(Vec::new()));

        let mut slots = Vec::with_capacity(workers.len());
        let mut consumers = Vec::with_capacity(workers.len());

        for (index, worker) in workers.into_iter().enumerate() {
            let (tx, rx) = crossbeam_channel::unbounded();
            let queued = Arc::new(AtomicUsize::new(0));
            let busy = Arc::new(AtomicBool::new(false));

            let consumer = Consumer {
                index,
                worker,
                rx,
                queued: Arc::clone(&queued),
                busy: Arc::clone(&busy),
                pending: Arc::clone(&pending),
                stopping: Arc::clone(&stopping),
                loaded: Arc::clone(&loaded),
            };
            // Thread spawn failing at construction time leaves no sane
            // degraded mode.
            #[allow(clippy::expect_used)]
            let handle = std::thread::Builder::new()
                .name(format!("roma-consumer-{index}"))
                .spawn(move || consumer.run())
                .expect("failed to start consumer thread");

            slots.push(WorkerSlot { tx, queued, busy });
            consumers.push(handle);
        }

        Self {
            slots,
            pending,
            max_pending: max_pending_requests,
            stopping,
            consumers: Mutex::new(consumers),
            loaded,
        }
    }

    /// Number of requests currently in flight or queued.
    pub fn pending_requests(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Install a code version on every worker.
    ///
    /// Counts as one pending request. The callback fires once all workers
    /// acknowledged (or the first failure, after all workers answered).
    #[instrument(skip(self, callback), level = "debug", fields(version = %spec.version_string))]
    pub fn load(
        &self,
        spec: CodeSpec,
        callback: impl FnOnce(Result<ResponseObject>) + Send + 'static,
    ) -> Result<()> {
        self.admit()?;

        // Record for replay before dispatch so a replacement spawned while
        // this load is in flight cannot miss it.
        self.loaded.lock().push(spec.clone());

        let fan_in = Arc::new(LoadFanIn {
            code_id: spec.id.clone(),
            remaining: AtomicUsize::new(self.slots.len()),
            failure: Mutex::new(None),
            callback: Mutex::new(Some(Box::new(callback))),
            pending: Arc::clone(&self.pending),
        });

        for slot in &self.slots {
            slot.queued.fetch_add(1, Ordering::AcqRel);
            if slot
                .tx
                .send(Job::Load {
                    spec: spec.clone(),
                    fan_in: Arc::clone(&fan_in),
                })
                .is_err()
            {
                slot.queued.fetch_sub(1, Ordering::AcqRel);
                fan_in.complete(Err(RomaError::Shutdown));
            }
        }
        Ok(())
    }

    /// Queue one invocation. Returns immediately; the result arrives
    /// through the callback.
    #[instrument(skip(self, spec, callback), level = "debug", fields(uuid = %spec.request_uuid))]
    pub fn invoke(
        &self,
        spec: ExecuteSpec,
        callback: impl FnOnce(Result<ResponseObject>) + Send + 'static,
    ) -> Result<()> {
        self.admit()?;

        let slot = &self.slots[self.choose_worker()];
        slot.queued.fetch_add(1, Ordering::AcqRel);
        if slot
            .tx
            .send(Job::Invoke {
                spec,
                callback: Box::new(callback),
            })
            .is_err()
        {
            slot.queued.fetch_sub(1, Ordering::AcqRel);
            self.pending.fetch_sub(1, Ordering::AcqRel);
            metrics::gauge!(METRIC_PENDING_REQUESTS).decrement(1);
            return Err(RomaError::Shutdown);
        }
        Ok(())
    }

    /// Stop every worker and join the consumer threads. Queued requests
    /// that have not started fail with [`RomaError::Shutdown`].
    #[instrument(skip_all, level = "info")]
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        for slot in &self.slots {
            let _ = slot.tx.send(Job::Stop);
        }
        let mut consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers.drain(..) {
            let _ = consumer.join();
        }
    }

    /// Reserve one pending-request unit, or refuse admission.
    fn admit(&self) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(RomaError::Shutdown);
        }
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            if current >= self.max_pending {
                metrics::counter!(METRIC_QUEUE_FULL_REJECTIONS).increment(1);
                return Err(RomaError::QueueFull);
            }
            match self.pending.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    metrics::gauge!(METRIC_PENDING_REQUESTS).increment(1);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Pick the target worker: any idle one first, else the shortest local
    /// queue; ties go to the lowest index.
    fn choose_worker(&self) -> usize {
        let mut best = 0;
        let mut best_queue = usize::MAX;
        for (index, slot) in self.slots.iter().enumerate() {
            let queued = slot.queued.load(Ordering::Acquire);
            if queued == 0 && !slot.busy.load(Ordering::Acquire) {
                return index;
            }
            let effective = queued + usize::from(slot.busy.load(Ordering::Acquire));
            if effective < best_queue {
                best_queue = effective;
                best = index;
            }
        }
        best
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if !self.stopping.load(Ordering::SeqCst) {
            self.stop();
        }
    }
}

/// The per-worker result pump: dequeues jobs, performs the IPC round trip,
/// settles callbacks, and replaces the worker when it dies.
struct Consumer {
    index: usize,
    worker: WorkerSandbox,
    rx: Receiver<Job>,
    queued: Arc<AtomicUsize>,
    busy: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    stopping: Arc<AtomicBool>,
    loaded: Arc<Mutex<Vec<CodeSpec>>>,
}

impl Consumer {
    fn run(mut self) {
        // Set once respawning the worker has terminally failed; every
        // subsequent job is refused with a crash error.
        let mut dead = false;

        loop {
            let job = match self.rx.recv() {
                Ok(job) => job,
                Err(_) => break,
            };
            match job {
                Job::Stop => {
                    let _ = self.worker.stop();
                    break;
                }
                Job::Load { spec, fan_in } => {
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                    if self.stopping.load(Ordering::SeqCst) {
                        fan_in.complete(Err(RomaError::Shutdown));
                        continue;
                    }
                    if dead {
                        fan_in.complete(Err(worker_down(self.index)));
                        continue;
                    }
                    let result = self.worker.load(&spec);
                    let crashed = matches!(&result, Err(RomaError::WorkerCrash(_)));
                    fan_in.complete(result);
                    if crashed {
                        match self.replace_worker() {
                            Replaced::Serving => {}
                            Replaced::Dead => dead = true,
                            Replaced::StopReceived => break,
                        }
                    }
                }
                Job::Invoke { spec, callback } => {
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                    if self.stopping.load(Ordering::SeqCst) {
                        self.settle(callback, Err(RomaError::Shutdown));
                        continue;
                    }
                    if dead {
                        self.settle(callback, Err(worker_down(self.index)));
                        continue;
                    }

                    self.busy.store(true, Ordering::Release);
                    let result = self.worker.invoke(&spec);
                    self.busy.store(false, Ordering::Release);

                    metrics::counter!(METRIC_INVOCATIONS).increment(1);
                    let crashed = matches!(&result, Err(RomaError::WorkerCrash(_)));
                    self.settle(callback, result);
                    if crashed {
                        match self.replace_worker() {
                            Replaced::Serving => {}
                            Replaced::Dead => dead = true,
                            Replaced::StopReceived => break,
                        }
                    }
                }
            }
        }
    }

    /// Decrement the pending counter and deliver the result.
    fn settle(&self, callback: CompletionCallback, result: Result<ResponseObject>) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        metrics::gauge!(METRIC_PENDING_REQUESTS).decrement(1);
        callback(result);
    }

    /// Crash recovery: drain everything already queued behind the dead
    /// worker, then spawn a replacement and replay the loaded versions on
    /// it.
    fn replace_worker(&mut self) -> Replaced {
        tracing::warn!(worker = self.index, "worker died, replacing it");
        metrics::counter!(METRIC_WORKER_REPLACEMENTS).increment(1);

        while let Ok(job) = self.rx.try_recv() {
            match job {
                Job::Stop => {
                    // Stop is always the final job on the queue; the slot
                    // shuts down instead of being replaced.
                    let _ = self.worker.stop();
                    return Replaced::StopReceived;
                }
                Job::Load { fan_in, .. } => {
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                    fan_in.complete(Err(worker_down(self.index)));
                }
                Job::Invoke { callback, .. } => {
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                    self.settle(callback, Err(worker_down(self.index)));
                }
            }
        }

        for attempt in 1..=RESPAWN_ATTEMPTS {
            match self.worker.respawn() {
                Ok(()) => {
                    // Replacements must learn every version before they
                    // serve invocations.
                    let replay = self.loaded.lock().clone();
                    for spec in &replay {
                        if let Err(err) = self.worker.load(spec) {
                            tracing::error!(
                                worker = self.index,
                                version = %spec.version_string,
                                %err,
                                "replaying a code version on the replacement failed"
                            );
                            if matches!(err, RomaError::WorkerCrash(_)) {
                                return Replaced::Dead;
                            }
                        }
                    }
                    tracing::info!(worker = self.index, "replacement worker is serving");
                    return Replaced::Serving;
                }
                Err(err) => {
                    tracing::error!(worker = self.index, attempt, %err, "respawn failed");
                    std::thread::sleep(std::time::Duration::from_millis(50 * attempt as u64));
                }
            }
        }
        tracing::error!(worker = self.index, "giving up on this worker slot");
        Replaced::Dead
    }
}

/// Outcome of a worker replacement attempt.
enum Replaced {
    /// The slot has a live replacement and replayed all loads.
    Serving,
    /// Respawn failed terminally; the slot refuses further work.
    Dead,
    /// A stop request surfaced during the drain; the consumer exits.
    StopReceived,
}

fn worker_down(index: usize) -> RomaError {
    RomaError::WorkerCrash(format!("worker {index} is down"))
}
