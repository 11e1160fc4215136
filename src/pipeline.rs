//! Ordered parallel pipeline.
//!
//! [`parallel_pipe`] runs a worker function over a lazy job sequence on a
//! fixed pool of threads and yields the results in source order, however the
//! workers interleave.  The ordering protocol: each worker, under one
//! dispatch mutex, takes a job from the bounded job queue, allocates a fresh
//! single-slot result sink, and pushes that sink onto the bounded
//! ordered-results queue.  Sinks therefore enter the results queue in source
//! order, and the consumer yields them in that order by blocking on each
//! sink's single slot in turn.  The actual work runs outside the mutex, so
//! throughput scales with the worker count.
//!
//! A worker receives its sink as an owned [`OutputSlot`] and may deposit zero
//! or one result.  Depositing zero results hands the obligation to fill the
//! slot to whichever actor the worker gave the slot to — this is how the QA
//! cache delivers one thread's answer to another thread's sink without
//! blocking a pool thread.
//!
//! End of input is channel disconnection: the source reader dropping its
//! sender ends the workers, the workers dropping theirs ends the consumer.
//! The first worker or source error is recorded once; recording aborts the
//! run by flagging every thread, draining the job queue, and marking every
//! outstanding sink, so no actor stays blocked.  The consumer yields the
//! recorded error after the ordered prefix of results that preceded it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

/// Job and results queue capacity, per worker.
const QUEUE_SLOTS_PER_WORKER: usize = 10;

// ── Output slot ──────────────────────────────────────────────────────────────

/// Owned single-slot sink for one job's result.
///
/// At most one result is ever deposited; the slot may be handed to another
/// actor to fulfil later.
pub struct OutputSlot<R> {
    tx: Sender<Option<R>>,
}

impl<R> OutputSlot<R> {
    /// Deposit the job's single result.  Never blocks; if the run has been
    /// aborted or the consumer is gone, the value is discarded.
    pub fn deposit(self, result: R) {
        let _ = self.tx.try_send(Some(result));
    }
}

/// A detached slot with a local receiver, for callers that want to block on
/// an answer themselves.
pub(crate) fn local_slot<R>() -> (OutputSlot<R>, Receiver<Option<R>>) {
    let (tx, rx) = bounded(1);
    (OutputSlot { tx }, rx)
}

// ── Shared state ─────────────────────────────────────────────────────────────

struct Shared<R, E> {
    error: Mutex<Option<E>>,
    aborted: AtomicBool,
    /// Sinks created but not yet consumed, keyed by source position.
    slots: Mutex<BTreeMap<u64, Sender<Option<R>>>>,
}

impl<R, E> Shared<R, E> {
    fn new() -> Shared<R, E> {
        Shared { error: Mutex::new(None), aborted: AtomicBool::new(false), slots: Mutex::new(BTreeMap::new()) }
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Record the first error and abort the run; later errors are dropped.
    fn record_error(&self, err: E) {
        {
            let mut slot = self.error.lock().expect("pipeline error slot poisoned");
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.abort();
    }

    /// Flag every thread and mark every outstanding sink so that no consumer
    /// or waiter stays blocked on a result that will never arrive.
    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        let slots = self.slots.lock().expect("pipeline slot table poisoned");
        for tx in slots.values() {
            let _ = tx.try_send(None);
        }
    }

    fn register_slot(&self, seq: u64, tx: Sender<Option<R>>) {
        self.slots.lock().expect("pipeline slot table poisoned").insert(seq, tx);
    }

    fn prune_consumed(&self, consumed: u64) {
        let mut slots = self.slots.lock().expect("pipeline slot table poisoned");
        while let Some(entry) = slots.first_entry() {
            if *entry.key() < consumed {
                entry.remove();
            } else {
                break;
            }
        }
    }

    fn take_error(&self) -> Option<E> {
        self.error.lock().expect("pipeline error slot poisoned").take()
    }
}

/// Job acquisition and result-slot ordering happen as one atomic step under
/// this state's mutex.
struct Dispatch<J, R> {
    job_rx: Receiver<J>,
    results_tx: Sender<Receiver<Option<R>>>,
    next_seq: u64,
}

// ── Threads ──────────────────────────────────────────────────────────────────

/// Turns a panic in a pipeline thread into a run abort, so the consumer
/// unblocks and surfaces the panic at join time.
struct AbortOnPanic<'a, R, E>(&'a Shared<R, E>);

impl<R, E> Drop for AbortOnPanic<'_, R, E> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort();
        }
    }
}

fn source_loop<J, R, E, S>(source: S, job_tx: Sender<J>, shared: Arc<Shared<R, E>>)
where
    S: Iterator<Item = Result<J, E>>,
{
    let _abort_on_panic = AbortOnPanic(&shared);
    for item in source {
        if shared.is_aborted() {
            return;
        }
        match item {
            Ok(job) => {
                if job_tx.send(job).is_err() {
                    return;
                }
            }
            Err(e) => {
                shared.record_error(e);
                return;
            }
        }
        if shared.is_aborted() {
            return;
        }
    }
}

fn worker_loop<J, R, E, F>(
    dispatch: Arc<Mutex<Dispatch<J, R>>>,
    job_drain: Receiver<J>,
    shared: Arc<Shared<R, E>>,
    worker: Arc<F>,
) where
    F: Fn(OutputSlot<R>, J) -> Result<(), E>,
{
    let _abort_on_panic = AbortOnPanic(&shared);
    loop {
        if shared.is_aborted() {
            return;
        }
        let (slot, job) = {
            let mut dp = dispatch.lock().expect("pipeline dispatch mutex poisoned");
            let job = match dp.job_rx.recv() {
                Ok(job) => job,
                Err(_) => return, // source exhausted and queue drained
            };
            let (tx, rx) = bounded(1);
            shared.register_slot(dp.next_seq, tx.clone());
            dp.next_seq += 1;
            if dp.results_tx.send(rx).is_err() {
                return; // consumer gone
            }
            (OutputSlot { tx }, job)
        };
        if let Err(e) = worker(slot, job) {
            shared.record_error(e);
            // Unblock the source reader.
            while job_drain.try_recv().is_ok() {}
        }
    }
}

// ── Consumer ─────────────────────────────────────────────────────────────────

/// Consumer half of [`parallel_pipe`]: yields worker results in source order,
/// then the first recorded error, if any.
pub struct PllPipe<R, E> {
    results_rx: Receiver<Receiver<Option<R>>>,
    shared: Arc<Shared<R, E>>,
    drain_jobs: Box<dyn Fn() + Send>,
    handles: Vec<JoinHandle<()>>,
    consumed: u64,
    finished: bool,
}

impl<R, E> PllPipe<R, E> {
    fn finish(&mut self) -> Option<Result<R, E>> {
        self.finished = true;
        self.shared.abort();
        (self.drain_jobs)();
        while self.results_rx.try_recv().is_ok() {}
        for handle in self.handles.drain(..) {
            handle.join().expect("pipeline thread panicked");
        }
        self.shared.take_error().map(Err)
    }
}

impl<R, E> Iterator for PllPipe<R, E> {
    type Item = Result<R, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.results_rx.recv() {
            Ok(slot_rx) => match slot_rx.recv() {
                Ok(Some(result)) => {
                    self.consumed += 1;
                    self.shared.prune_consumed(self.consumed);
                    Some(Ok(result))
                }
                Ok(None) | Err(_) => self.finish(),
            },
            Err(_) => self.finish(),
        }
    }
}

impl<R, E> Drop for PllPipe<R, E> {
    fn drop(&mut self) {
        if !self.finished {
            // Consumer abandoned mid-stream: unblock everything and let the
            // threads run out on their own.
            self.shared.abort();
            (self.drain_jobs)();
            while self.results_rx.try_recv().is_ok() {}
        }
    }
}

// ── Entry point ──────────────────────────────────────────────────────────────

/// Run `worker` over `source` on `workers` threads, yielding results in
/// source order.
pub fn parallel_pipe<J, R, E, S, F>(source: S, worker: F, workers: usize) -> PllPipe<R, E>
where
    J: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    S: Iterator<Item = Result<J, E>> + Send + 'static,
    F: Fn(OutputSlot<R>, J) -> Result<(), E> + Send + Sync + 'static,
{
    let workers = workers.max(1);
    let capacity = workers * QUEUE_SLOTS_PER_WORKER;
    let (job_tx, job_rx) = bounded(capacity);
    let (results_tx, results_rx) = bounded(capacity);
    let shared = Arc::new(Shared::new());
    let dispatch = Arc::new(Mutex::new(Dispatch { job_rx: job_rx.clone(), results_tx, next_seq: 0 }));
    let worker = Arc::new(worker);

    let mut handles = Vec::with_capacity(workers + 1);
    {
        let shared = Arc::clone(&shared);
        handles.push(
            thread::Builder::new()
                .name("pipe-source".into())
                .spawn(move || source_loop(source, job_tx, shared))
                .expect("failed to spawn pipeline source thread"),
        );
    }
    for n in 0..workers {
        let dispatch = Arc::clone(&dispatch);
        let job_drain = job_rx.clone();
        let shared = Arc::clone(&shared);
        let worker = Arc::clone(&worker);
        handles.push(
            thread::Builder::new()
                .name(format!("pipe-worker-{n}"))
                .spawn(move || worker_loop(dispatch, job_drain, shared, worker))
                .expect("failed to spawn pipeline worker thread"),
        );
    }

    PllPipe {
        results_rx,
        shared,
        drain_jobs: Box::new(move || while job_rx.try_recv().is_ok() {}),
        handles,
        consumed: 0,
        finished: false,
    }
}
