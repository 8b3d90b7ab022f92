//! The reactor's dispatch loop.
//!
//! An [EventLoop] is built on the thread that will run it and is `!Send`:
//! holding `&EventLoop` proves the code is already on the loop's thread, so
//! all loop-owned state (poller, channels, timer wheel) is mutated without
//! locks. Other threads interact through the cloneable [LoopHandle], whose
//! mutex-guarded pending-task queue is the only cross-thread-synchronized
//! structure; an `eventfd` unparks a loop blocked in `epoll_wait`.

use std::cell::RefCell;
use std::mem;
use std::os::unix::io::RawFd;
use std::process;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use crate::reactor::{Channel, Poller, TimerWheel};
use crate::{Result, errno, error};

thread_local! {
    static CURRENT: RefCell<Option<Rc<EventLoop>>> = const { RefCell::new(None) };
}

/// Deferred unit of work marshaled onto a loop's thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// Shareable, thread-safe handle to one event loop.
pub struct LoopHandle {
    /// Identity of the thread the loop was built on; every loop-affine
    /// operation compares against it.
    tid: ThreadId,
    wake_fd: RawFd,
    pending: Mutex<Vec<Task>>,
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("tid", &self.tid)
            .field("wake_fd", &self.wake_fd)
            .finish_non_exhaustive()
    }
}

impl LoopHandle {
    /// Whether the calling thread is the loop's own thread.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.tid
    }

    /// Executes `task` synchronously when called from the loop's own thread,
    /// otherwise enqueues it and wakes the loop.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Always enqueues `task` for the loop's next pending-task drain, even
    /// from the loop's own thread. Used when deferred-until-next-cycle
    /// semantics are required.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.pending.lock().unwrap().push(Box::new(task));
        self.wake();
    }

    /// Unblocks the loop's `epoll_wait` by bumping the eventfd counter.
    fn wake(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wake_fd,
                &raw const one as *const libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if n != mem::size_of::<u64>() as isize {
            let err = std::io::Error::last_os_error();
            // A full counter already guarantees a pending wake-up.
            if err.kind() != std::io::ErrorKind::WouldBlock {
                error!("failed to write to wake eventfd: {err}");
                process::exit(1);
            }
        }
    }

    pub(crate) fn drain_pending(&self) -> Vec<Task> {
        mem::take(&mut *self.pending.lock().unwrap())
    }
}

/// One reactor: poller, timer wheel, wake channel, and pending-task queue,
/// bound to the thread that constructed it.
pub struct EventLoop {
    handle: Arc<LoopHandle>,
    poller: RefCell<Poller>,
    wheel: RefCell<TimerWheel>,
    timer_fd: RawFd,
    wake_channel: Rc<Channel>,
    timer_channel: Rc<Channel>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("handle", &self.handle)
            .field("timer_fd", &self.timer_fd)
            .finish_non_exhaustive()
    }
}

impl EventLoop {
    /// Creates the loop owned by the calling thread, including its epoll
    /// instance, wake eventfd, and one-second periodic timerfd.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already owns an event loop.
    pub fn new() -> Result<Rc<Self>> {
        CURRENT.with(|current| {
            assert!(
                current.borrow().is_none(),
                "a thread may own at most one event loop"
            );
        });

        let poller = Poller::new()?;

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd == -1 {
            return Err(errno!("failed to create wake eventfd"));
        }

        let timer_fd = match init_timer_fd() {
            Ok(fd) => fd,
            Err(err) => {
                unsafe {
                    let _ = libc::close(wake_fd);
                }
                return Err(err);
            }
        };

        let event_loop = Rc::new(EventLoop {
            handle: Arc::new(LoopHandle {
                tid: thread::current().id(),
                wake_fd,
                pending: Mutex::new(Vec::new()),
            }),
            poller: RefCell::new(poller),
            wheel: RefCell::new(TimerWheel::new()),
            timer_fd,
            wake_channel: Channel::new(wake_fd),
            timer_channel: Channel::new(timer_fd),
        });

        event_loop
            .wake_channel
            .set_read_callback(Box::new(move || drain_eventfd(wake_fd)));
        event_loop
            .timer_channel
            .set_read_callback(Box::new(|| EventLoop::current().on_timer_tick()));

        event_loop.wake_channel.enable_read(&event_loop);
        event_loop.timer_channel.enable_read(&event_loop);

        CURRENT.with(|current| {
            *current.borrow_mut() = Some(event_loop.clone());
        });

        Ok(event_loop)
    }

    /// The loop owned by the calling thread.
    ///
    /// # Panics
    ///
    /// Panics when the calling thread runs no event loop; reaching for
    /// loop-owned state from a foreign thread is a contract breach, not a
    /// recoverable error.
    pub fn current() -> Rc<Self> {
        CURRENT
            .with(|current| current.borrow().clone())
            .expect("no event loop is running on this thread")
    }

    /// Thread-safe handle for marshaling work onto this loop.
    pub fn handle(&self) -> Arc<LoopHandle> {
        self.handle.clone()
    }

    /// Whether the calling thread is the loop's own thread.
    pub fn is_in_loop_thread(&self) -> bool {
        self.handle.is_in_loop_thread()
    }

    /// See [LoopHandle::run_in_loop].
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle.run_in_loop(task);
    }

    /// See [LoopHandle::queue_in_loop].
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle.queue_in_loop(task);
    }

    /// Registers `channel` or re-applies its interest mask. An `epoll_ctl`
    /// failure here leaves the registry inconsistent with the kernel and is
    /// unrecoverable.
    pub fn update_channel(&self, channel: &Rc<Channel>) {
        self.poller.borrow_mut().update(channel).unwrap_or_else(|err| {
            error!("{err}");
            process::exit(1);
        });
    }

    /// Deregisters `channel` from the poller. Must happen before the
    /// descriptor is closed.
    pub fn remove_channel(&self, channel: &Rc<Channel>) {
        self.poller.borrow_mut().remove(channel).unwrap_or_else(|err| {
            error!("{err}");
            process::exit(1);
        });
    }

    /// Looks up the channel registered for `fd` with this loop's poller.
    pub fn channel(&self, fd: RawFd) -> Option<Rc<Channel>> {
        self.poller.borrow().channel(fd)
    }

    /// Schedules `action` on the timer wheel to fire `timeout` ticks from
    /// now under `id`.
    pub fn run_after(&self, id: u64, timeout: u64, action: impl FnOnce() + 'static) {
        self.wheel.borrow_mut().add_task(id, timeout, Box::new(action));
    }

    /// Restarts the countdown of timer task `id`.
    pub fn refresh_after(&self, id: u64) {
        self.wheel.borrow_mut().refresh_task(id);
    }

    /// Cancels timer task `id`.
    pub fn remove_after(&self, id: u64) {
        self.wheel.borrow_mut().remove_task(id);
    }

    /// Whether a timer task is registered under `id`.
    pub fn has_after(&self, id: u64) -> bool {
        self.wheel.borrow().has_task(id)
    }

    /// Runs the dispatch cycle forever: block in `epoll_wait`, dispatch
    /// every ready channel, then drain the tasks queued before the drain
    /// began. Tasks queued during the drain run on the next cycle, so a task
    /// that re-queues itself cannot starve the poller.
    ///
    /// There is no graceful-stop primitive; shutdown is by process
    /// termination, and a poll failure other than an interrupt is fatal.
    pub fn start(&self) -> ! {
        loop {
            let ready = self.poller.borrow_mut().poll(None).unwrap_or_else(|err| {
                error!("{err}");
                process::exit(1);
            });

            for channel in &ready {
                channel.handle_event();
            }

            for task in self.handle.drain_pending() {
                task();
            }
        }
    }

    /// Read callback of the timer channel: drains the expiration counter and
    /// advances the wheel once per elapsed tick.
    fn on_timer_tick(&self) {
        let mut expirations: u64 = 0;
        let n = unsafe {
            libc::read(
                self.timer_fd,
                &raw mut expirations as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if n != mem::size_of::<u64>() as isize {
            let err = std::io::Error::last_os_error();
            match err.kind() {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => return,
                _ => {
                    error!("failed to read from timerfd: {err}");
                    process::exit(1);
                }
            }
        }

        for _ in 0..expirations {
            self.advance_wheel();
        }
    }

    /// Advances the wheel one tick and fires every task whose last owning
    /// reference was just released. Firing happens with no borrow of the
    /// wheel held, so actions may schedule or cancel timers.
    fn advance_wheel(&self) {
        let released = self.wheel.borrow_mut().advance();
        for task in released {
            if Rc::strong_count(&task) == 1 {
                task.fire();
                self.wheel.borrow_mut().forget(&task);
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // The poller closes its own epoll descriptor; the wake eventfd and
        // the timerfd are owned here. The thread-local keeps the loop alive
        // until its thread exits, so no live handle can wake a closed fd.
        unsafe {
            let _ = libc::close(self.timer_fd);
            let _ = libc::close(self.handle.wake_fd);
        }
    }
}

/// Creates the non-blocking timerfd that drives the wheel, armed to expire
/// once per second.
fn init_timer_fd() -> Result<RawFd> {
    unsafe {
        let timer_fd = libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        );
        if timer_fd == -1 {
            return Err(errno!("failed to create timerfd"));
        }

        let time_spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 1,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: 1,
                tv_nsec: 0,
            },
        };

        if libc::timerfd_settime(timer_fd, 0, &raw const time_spec, std::ptr::null_mut()) == -1 {
            let _ = libc::close(timer_fd);
            return Err(errno!("failed to arm timerfd"));
        }

        Ok(timer_fd)
    }
}

/// Read callback of the wake channel: clears the eventfd counter so a parked
/// loop observes at most one wake-up per batch of queued tasks.
fn drain_eventfd(wake_fd: RawFd) {
    let mut count: u64 = 0;
    let n = unsafe {
        libc::read(
            wake_fd,
            &raw mut count as *mut libc::c_void,
            mem::size_of::<u64>(),
        )
    };
    if n != mem::size_of::<u64>() as isize {
        let err = std::io::Error::last_os_error();
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => {}
            _ => {
                error!("failed to read from wake eventfd: {err}");
                process::exit(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn run_in_loop_is_synchronous_on_the_owning_thread() {
        let event_loop = EventLoop::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        event_loop.run_in_loop(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        // Executed before run_in_loop returned, with nothing left queued.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(event_loop.handle().drain_pending().is_empty());
    }

    #[test]
    fn queue_in_loop_defers_even_on_the_owning_thread() {
        let event_loop = EventLoop::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        event_loop.queue_in_loop(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        for task in event_loop.handle().drain_pending() {
            task();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dead_loops_release_their_descriptors() {
        let open_fds = || std::fs::read_dir("/proc/self/fd").unwrap().count();

        // First loop up front so one-time allocations settle.
        thread::spawn(|| {
            let _ = EventLoop::new().unwrap();
        })
        .join()
        .unwrap();

        let before = open_fds();
        for _ in 0..16 {
            thread::spawn(|| {
                let _ = EventLoop::new().unwrap();
            })
            .join()
            .unwrap();
        }
        let after = open_fds();

        // Each loop holds an epoll fd, an eventfd, and a timerfd; leaking
        // them would add 48 descriptors here. Slack absorbs descriptors
        // opened by concurrently running tests.
        assert!(
            after <= before + 8,
            "descriptor count grew from {before} to {after}"
        );
    }

    #[test]
    fn timer_delegation_reaches_the_wheel() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        event_loop.run_after(42, 2, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(event_loop.has_after(42));

        event_loop.advance_wheel();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        event_loop.advance_wheel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!event_loop.has_after(42));
    }
}
