//! Worker loop threads and their round-robin pool.

use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::error;
use crate::reactor::{EventLoop, LoopHandle};

/// One dedicated thread running one event loop forever.
///
/// The constructor blocks until the loop exists on its thread and has
/// published its handle, so a freshly built `LoopThread` is always safe to
/// hand work to.
#[derive(Debug)]
pub struct LoopThread {
    handle: Arc<LoopHandle>,
    _thread: thread::JoinHandle<()>,
}

impl LoopThread {
    /// Spawns the thread, waits for its loop to come up, and returns.
    pub fn new() -> Self {
        let published = Arc::new((Mutex::new(None::<Arc<LoopHandle>>), Condvar::new()));

        let publish = published.clone();
        let thread = thread::spawn(move || {
            let event_loop = EventLoop::new().unwrap_or_else(|err| {
                error!("failed to create worker event loop: {err}");
                process::exit(1);
            });

            let (slot, cond) = &*publish;
            *slot.lock().unwrap() = Some(event_loop.handle());
            cond.notify_all();

            event_loop.start();
        });

        let (slot, cond) = &*published;
        let mut guard = slot.lock().unwrap();
        while guard.is_none() {
            guard = cond.wait(guard).unwrap();
        }
        let handle = guard.take().unwrap();
        drop(guard);

        LoopThread {
            handle,
            _thread: thread,
        }
    }

    /// Handle of the loop running on this thread.
    pub fn handle(&self) -> Arc<LoopHandle> {
        self.handle.clone()
    }
}

impl Default for LoopThread {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed set of worker loops handed out round-robin.
///
/// With zero workers every request yields the base loop, interleaving accept
/// and connection I/O on one thread.
#[derive(Debug)]
pub struct LoopThreadPool {
    base: Arc<LoopHandle>,
    threads: Mutex<Vec<LoopThread>>,
    next: AtomicUsize,
}

impl LoopThreadPool {
    /// Creates an empty pool that falls back to `base`.
    pub fn new(base: Arc<LoopHandle>) -> Self {
        LoopThreadPool {
            base,
            threads: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    /// Pre-spawns `count` worker loops, blocking until each is running.
    pub fn start(&self, count: usize) {
        let mut threads = self.threads.lock().unwrap();
        for _ in 0..count {
            threads.push(LoopThread::new());
        }
    }

    /// Next loop in strict round-robin order.
    pub fn next_loop(&self) -> Arc<LoopHandle> {
        let threads = self.threads.lock().unwrap();
        if threads.is_empty() {
            return self.base.clone();
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % threads.len();
        threads[idx].handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn cross_thread_task_runs_exactly_once_on_the_loop_thread() {
        let worker = LoopThread::new();
        let (tx, rx) = mpsc::channel();

        let handle = worker.handle();
        assert!(!handle.is_in_loop_thread());

        handle.run_in_loop(move || {
            tx.send(thread::current().id()).unwrap();
        });

        let loop_tid = rx.recv().unwrap();
        assert_ne!(loop_tid, thread::current().id());
        // Exactly once: no second message ever arrives.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn round_robin_wraps_around() {
        let base = LoopThread::new();
        let pool = LoopThreadPool::new(base.handle());
        pool.start(2);

        let first = pool.next_loop();
        let second = pool.next_loop();
        let third = pool.next_loop();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));
        assert!(!Arc::ptr_eq(&first, &base.handle()));
    }

    #[test]
    fn empty_pool_yields_the_base_loop() {
        let base = LoopThread::new();
        let pool = LoopThreadPool::new(base.handle());

        assert!(Arc::ptr_eq(&pool.next_loop(), &base.handle()));
        assert!(Arc::ptr_eq(&pool.next_loop(), &base.handle()));
    }
}
