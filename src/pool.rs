//! Blocking worker pool for CPU-bound or otherwise slow work that must stay
//! off the event loop threads.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// A unit of work handed to the pool.
pub type Job = Box<dyn FnOnce() + Send>;

struct PoolState {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Fixed-size pool of threads consuming jobs from a shared queue.
///
/// Dropping the pool drains the queue: already-submitted jobs still run,
/// then the workers exit and are joined.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Spawns `size` worker threads. A zero-sized pool accepts jobs but
    /// never runs them until dropped, so `size` should be at least one.
    pub fn new(size: usize) -> Self {
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });

        let workers = (0..size)
            .map(|_| {
                let inner = inner.clone();
                thread::spawn(move || Self::worker_main(&inner))
            })
            .collect();

        WorkerPool { inner, workers }
    }

    /// Queues `job` for execution on some worker thread.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        state.jobs.push_back(Box::new(job));
        drop(state);
        self.inner.available.notify_one();
    }

    fn worker_main(inner: &PoolInner) {
        loop {
            let job = {
                let mut state = inner.state.lock().unwrap();
                loop {
                    if let Some(job) = state.jobs.pop_front() {
                        break job;
                    }
                    if state.shutdown {
                        return;
                    }
                    state = inner.available.wait(state).unwrap();
                }
            };
            job();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.inner.state.lock().unwrap().shutdown = true;
        self.inner.available.notify_all();

        for worker in self.workers.drain(..) {
            // A worker that panicked already surfaced its own error.
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn jobs_run_off_the_submitting_thread() {
        let pool = WorkerPool::new(1);
        let (tx, rx) = mpsc::channel();

        pool.submit(move || {
            tx.send(thread::current().id()).unwrap();
        });

        assert_ne!(rx.recv().unwrap(), thread::current().id());
    }

    #[test]
    fn drop_drains_pending_jobs() {
        let ran = Arc::new(AtomicUsize::new(0));

        let pool = WorkerPool::new(2);
        for _ in 0..64 {
            let ran = ran.clone();
            pool.submit(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool);

        assert_eq!(ran.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn submissions_after_shutdown_are_ignored() {
        let pool = WorkerPool::new(1);
        pool.inner.state.lock().unwrap().shutdown = true;

        pool.submit(|| panic!("must not run"));
        assert!(pool.inner.state.lock().unwrap().jobs.is_empty());
    }
}
