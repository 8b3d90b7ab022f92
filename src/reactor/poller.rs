//! Thin wrapper over the epoll readiness multiplexer.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::reactor::Channel;
use crate::{Result, errno};

/// Maximum number of events returned by a single `epoll_wait` call.
const EPOLL_MAX_EVENTS: usize = 1024;

/// epoll instance plus the registry of channels it watches.
///
/// Invariant: a descriptor is registered with epoll if and only if it has an
/// entry in `channels`. Updates re-apply the channel's full interest mask
/// rather than applying deltas.
#[derive(Debug)]
pub struct Poller {
    epoll_fd: RawFd,
    channels: HashMap<RawFd, Rc<Channel>>,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    /// Creates an epoll instance. Failure here is unrecoverable for the
    /// owning loop.
    pub fn new() -> Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(errno!("failed to create epoll instance"));
        }

        Ok(Poller {
            epoll_fd,
            channels: HashMap::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; EPOLL_MAX_EVENTS],
        })
    }

    /// Registers `channel` on first sight, otherwise re-applies its current
    /// interest mask.
    pub fn update(&mut self, channel: &Rc<Channel>) -> Result<()> {
        let fd = channel.fd();
        if self.channels.contains_key(&fd) {
            self.epoll_op(libc::EPOLL_CTL_MOD, channel)
        } else {
            self.epoll_op(libc::EPOLL_CTL_ADD, channel)?;
            self.channels.insert(fd, channel.clone());
            Ok(())
        }
    }

    /// Deregisters and forgets `channel`. A channel that was never registered
    /// is ignored.
    pub fn remove(&mut self, channel: &Rc<Channel>) -> Result<()> {
        if self.channels.remove(&channel.fd()).is_some() {
            self.epoll_op(libc::EPOLL_CTL_DEL, channel)?;
        }
        Ok(())
    }

    /// Looks up the channel registered for `fd`.
    pub fn channel(&self, fd: RawFd) -> Option<Rc<Channel>> {
        self.channels.get(&fd).cloned()
    }

    /// Performs one `epoll_wait` call, blocking indefinitely when `timeout`
    /// is `None`.
    ///
    /// Interruption yields an empty ready set so the caller simply polls
    /// again. Any other wait failure, or a ready descriptor with no
    /// registered channel, is an error the dispatch loop treats as fatal.
    pub fn poll(&mut self, timeout: Option<i32>) -> Result<Vec<Rc<Channel>>> {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout.unwrap_or(-1),
            )
        };

        if n == -1 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(errno!("failed to wait on epoll"));
        }

        let mut ready = Vec::with_capacity(n as usize);
        for event in self.events.iter().take(n as usize) {
            let fd = event.u64 as RawFd;
            match self.channels.get(&fd) {
                Some(channel) => {
                    channel.set_revents(event.events);
                    ready.push(channel.clone());
                }
                None => {
                    // A ready descriptor the registry does not know about
                    // means the registration invariant was broken.
                    return Err(crate::Error::Io(std::io::Error::other(format!(
                        "epoll reported readiness for unregistered fd {fd}"
                    ))));
                }
            }
        }
        Ok(ready)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epoll_fd);
        }
    }
}

impl Poller {
    fn epoll_op(&self, op: libc::c_int, channel: &Rc<Channel>) -> Result<()> {
        let fd = channel.fd();
        let mut ev = libc::epoll_event {
            events: channel.events(),
            u64: fd as u64,
        };

        if unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &raw mut ev) } == -1 {
            return Err(errno!("failed to apply epoll_ctl op {op} for fd {fd}"));
        }
        Ok(())
    }
}
