//! Per-slot component worker
//!
//! In Parallel tick mode, a component without a shared thread pool runs its
//! processing for each buffer slot on a dedicated worker thread, so the
//! circuit sweep can move on to the next component while this one is still
//! pulling inputs and processing. Downstream components synchronise by
//! waiting on the worker.
//!
//! The worker is a single persistent thread fed one job at a time through a
//! mutex/condvar pair. The engine's tick protocol guarantees a new job is
//! never dispatched before the previous one was awaited (reset waits for
//! completion), so a one-deep "queue" suffices.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single-component, single-buffer worker thread.
///
/// The thread is spawned lazily on the first dispatch: circuits that only
/// ever tick in Series mode never pay for it.
pub(crate) struct SlotWorker {
    inner: Arc<WorkerInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct WorkerInner {
    state: Mutex<WorkerState>,
    work_available: Condvar,
    work_done: Condvar,
}

#[derive(Default)]
struct WorkerState {
    job: Option<Job>,
    busy: bool,
    stop: bool,
}

impl SlotWorker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                state: Mutex::new(WorkerState::default()),
                work_available: Condvar::new(),
                work_done: Condvar::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Hand a job to the worker thread and return immediately.
    ///
    /// Must not be called while a previous job is still unfinished; the
    /// tick/reset protocol upholds this.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        self.ensure_spawned();

        let mut state = self.inner.state.lock();
        state.job = Some(Box::new(job));
        state.busy = true;
        self.inner.work_available.notify_one();
    }

    /// Block until the most recently dispatched job has finished.
    ///
    /// Returns immediately when the worker is idle.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while state.busy {
            self.inner.work_done.wait(&mut state);
        }
    }

    fn ensure_spawned(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *handle = Some(std::thread::spawn(move || worker_loop(&inner)));
    }
}

fn worker_loop(inner: &WorkerInner) {
    let mut state = inner.state.lock();
    loop {
        // a pending job is run even when a stop has been requested, so
        // dispatch followed by teardown never loses work
        if let Some(job) = state.job.take() {
            drop(state);
            job();
            state = inner.state.lock();
            state.busy = false;
            inner.work_done.notify_all();
            continue;
        }
        if state.stop {
            break;
        }
        inner.work_available.wait(&mut state);
    }
}

impl Drop for SlotWorker {
    fn drop(&mut self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            {
                let mut state = self.inner.state.lock();
                state.stop = true;
                self.inner.work_available.notify_one();
            }
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wait_on_idle_worker_returns_immediately() {
        let worker = SlotWorker::new();
        worker.wait();
    }

    #[test]
    fn dispatched_job_completes_before_wait_returns() {
        let worker = SlotWorker::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for expected in 1..=3 {
            let inner_counter = Arc::clone(&counter);
            worker.dispatch(move || {
                inner_counter.fetch_add(1, Ordering::SeqCst);
            });
            worker.wait();
            assert_eq!(counter.load(Ordering::SeqCst), expected);
        }
    }

    #[test]
    fn drop_joins_the_thread() {
        let worker = SlotWorker::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let job_counter = Arc::clone(&counter);
        worker.dispatch(move || {
            job_counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(worker);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
