//! Per-descriptor event routing.
//!
//! A [Channel] binds one file descriptor's interest mask and readiness
//! callbacks. It never owns the descriptor's lifetime; its owner must
//! deregister it from the loop before the descriptor is closed.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::reactor::EventLoop;

/// Callback invoked when a subscribed readiness condition is observed.
pub type EventCallback = Box<dyn Fn()>;

/// Event-routing record for a single file descriptor.
///
/// Channels are `Rc`-shared within their owning loop's thread and are never
/// sent across threads. Callbacks are installed before the channel is
/// registered and are not replaced afterwards.
pub struct Channel {
    fd: RawFd,
    /// Interest mask currently requested from epoll.
    events: Cell<u32>,
    /// Readiness mask observed for the current dispatch cycle.
    revents: Cell<u32>,

    read_cb: RefCell<Option<EventCallback>>,
    write_cb: RefCell<Option<EventCallback>>,
    error_cb: RefCell<Option<EventCallback>>,
    close_cb: RefCell<Option<EventCallback>>,
    event_cb: RefCell<Option<EventCallback>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &self.events.get())
            .field("revents", &self.revents.get())
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Creates a channel for `fd` with no interests and no callbacks.
    pub fn new(fd: RawFd) -> Rc<Self> {
        Rc::new(Channel {
            fd,
            events: Cell::new(0),
            revents: Cell::new(0),
            read_cb: RefCell::new(None),
            write_cb: RefCell::new(None),
            error_cb: RefCell::new(None),
            close_cb: RefCell::new(None),
            event_cb: RefCell::new(None),
        })
    }

    /// The file descriptor this channel routes events for.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Interest mask currently requested from epoll.
    pub fn events(&self) -> u32 {
        self.events.get()
    }

    /// Records the readiness mask reported by the poller for this cycle.
    pub fn set_revents(&self, revents: u32) {
        self.revents.set(revents);
    }

    /// Whether read readiness is currently subscribed.
    pub fn readable(&self) -> bool {
        self.events.get() & libc::EPOLLIN as u32 != 0
    }

    /// Whether write readiness is currently subscribed.
    pub fn writable(&self) -> bool {
        self.events.get() & libc::EPOLLOUT as u32 != 0
    }

    /// Installs the read-readiness callback.
    pub fn set_read_callback(&self, cb: EventCallback) {
        *self.read_cb.borrow_mut() = Some(cb);
    }

    /// Installs the write-readiness callback.
    pub fn set_write_callback(&self, cb: EventCallback) {
        *self.write_cb.borrow_mut() = Some(cb);
    }

    /// Installs the error-readiness callback.
    pub fn set_error_callback(&self, cb: EventCallback) {
        *self.error_cb.borrow_mut() = Some(cb);
    }

    /// Installs the peer-hangup callback.
    pub fn set_close_callback(&self, cb: EventCallback) {
        *self.close_cb.borrow_mut() = Some(cb);
    }

    /// Installs the generic callback fired after every dispatched event.
    pub fn set_event_callback(&self, cb: EventCallback) {
        *self.event_cb.borrow_mut() = Some(cb);
    }

    /// Subscribes to read readiness and re-applies the interest mask.
    pub fn enable_read(self: &Rc<Self>, event_loop: &EventLoop) {
        self.events.set(self.events.get() | libc::EPOLLIN as u32);
        event_loop.update_channel(self);
    }

    /// Unsubscribes from read readiness and re-applies the interest mask.
    pub fn disable_read(self: &Rc<Self>, event_loop: &EventLoop) {
        self.events.set(self.events.get() & !(libc::EPOLLIN as u32));
        event_loop.update_channel(self);
    }

    /// Subscribes to write readiness and re-applies the interest mask.
    pub fn enable_write(self: &Rc<Self>, event_loop: &EventLoop) {
        self.events.set(self.events.get() | libc::EPOLLOUT as u32);
        event_loop.update_channel(self);
    }

    /// Unsubscribes from write readiness and re-applies the interest mask.
    pub fn disable_write(self: &Rc<Self>, event_loop: &EventLoop) {
        self.events.set(self.events.get() & !(libc::EPOLLOUT as u32));
        event_loop.update_channel(self);
    }

    /// Clears the interest mask entirely.
    pub fn disable_all(self: &Rc<Self>, event_loop: &EventLoop) {
        self.events.set(0);
        event_loop.update_channel(self);
    }

    /// Dispatches the readiness mask observed for this cycle.
    ///
    /// Ordering: read, urgent, or peer-half-close readiness triggers the read
    /// callback; error readiness triggers the error callback *instead of* the
    /// write/close handling for this cycle; otherwise write readiness
    /// triggers the write callback, otherwise hangup triggers the close
    /// callback. The generic event callback always runs last, which lets a
    /// connection piggyback its idle-timer refresh onto "any activity".
    pub fn handle_event(&self) {
        let revents = self.revents.get();

        if revents & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32 != 0 {
            if let Some(cb) = self.read_cb.borrow().as_ref() {
                cb();
            }
        }
        if revents & libc::EPOLLERR as u32 != 0 {
            if let Some(cb) = self.error_cb.borrow().as_ref() {
                cb();
            }
        } else if revents & libc::EPOLLOUT as u32 != 0 {
            if let Some(cb) = self.write_cb.borrow().as_ref() {
                cb();
            }
        } else if revents & libc::EPOLLHUP as u32 != 0 {
            if let Some(cb) = self.close_cb.borrow().as_ref() {
                cb();
            }
        }
        if let Some(cb) = self.event_cb.borrow().as_ref() {
            cb();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn recording_channel(log: &Rc<RefCell<Vec<&'static str>>>) -> Rc<Channel> {
        let ch = Channel::new(-1);
        let l = log.clone();
        ch.set_read_callback(Box::new(move || l.borrow_mut().push("read")));
        let l = log.clone();
        ch.set_write_callback(Box::new(move || l.borrow_mut().push("write")));
        let l = log.clone();
        ch.set_error_callback(Box::new(move || l.borrow_mut().push("error")));
        let l = log.clone();
        ch.set_close_callback(Box::new(move || l.borrow_mut().push("close")));
        let l = log.clone();
        ch.set_event_callback(Box::new(move || l.borrow_mut().push("event")));
        ch
    }

    #[test]
    fn read_then_event_on_input_readiness() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let ch = recording_channel(&log);

        ch.set_revents(libc::EPOLLIN as u32);
        ch.handle_event();
        assert_eq!(*log.borrow(), ["read", "event"]);
    }

    #[test]
    fn error_suppresses_write_and_close_for_the_cycle() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let ch = recording_channel(&log);

        ch.set_revents((libc::EPOLLERR | libc::EPOLLOUT | libc::EPOLLHUP) as u32);
        ch.handle_event();
        assert_eq!(*log.borrow(), ["error", "event"]);
    }

    #[test]
    fn hangup_fires_close_when_no_error_or_write() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let ch = recording_channel(&log);

        ch.set_revents(libc::EPOLLHUP as u32);
        ch.handle_event();
        assert_eq!(*log.borrow(), ["close", "event"]);
    }

    #[test]
    fn interest_mask_accessors() {
        let ch = Channel::new(-1);
        assert!(!ch.readable());
        assert!(!ch.writable());

        ch.events.set((libc::EPOLLIN | libc::EPOLLOUT) as u32);
        assert!(ch.readable());
        assert!(ch.writable());
    }
}
