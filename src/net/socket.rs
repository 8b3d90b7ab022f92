//! Raw TCP socket wrapper over libc.
//!
//! The reactor core only needs a descriptor, recv/send that report
//! would-block as a zero count, and an idempotent close; everything else
//! here is setup convenience for servers, clients, and the demos.

use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::{Result, errno};

/// Default length of the pending-connection queue passed to `listen`.
pub const DEFAULT_BACKLOG: libc::c_int = 1024;

/// An IPv4 TCP socket.
///
/// The descriptor is held in an atomic so a shared socket can be closed
/// exactly once from its owning loop thread and again harmlessly on drop.
#[derive(Debug)]
pub struct Socket {
    fd: AtomicI32,
}

impl Socket {
    /// Creates a fresh, unbound TCP socket.
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_TCP) };
        if fd == -1 {
            return Err(errno!("failed to create socket"));
        }
        Ok(Socket::from_fd(fd))
    }

    /// Wraps an already-open descriptor, e.g. one returned by `accept`.
    pub fn from_fd(fd: RawFd) -> Self {
        Socket { fd: AtomicI32::new(fd) }
    }

    /// The underlying descriptor, or `-1` once closed.
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Relaxed)
    }

    /// Binds the socket to `ip:port`. Port `0` requests an ephemeral port,
    /// retrievable afterwards via [Socket::local_port].
    pub fn bind(&self, ip: Ipv4Addr, port: u16) -> Result<()> {
        let addr = sockaddr_in(ip, port);
        let ret = unsafe {
            libc::bind(
                self.fd(),
                &raw const addr as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret == -1 {
            return Err(errno!("failed to bind socket to {ip}:{port}"));
        }
        Ok(())
    }

    /// Starts listening for incoming connections.
    pub fn listen(&self, backlog: libc::c_int) -> Result<()> {
        if unsafe { libc::listen(self.fd(), backlog) } == -1 {
            return Err(errno!("failed to listen on socket"));
        }
        Ok(())
    }

    /// Connects to `ip:port`.
    pub fn connect(&self, ip: Ipv4Addr, port: u16) -> Result<()> {
        let addr = sockaddr_in(ip, port);
        let ret = unsafe {
            libc::connect(
                self.fd(),
                &raw const addr as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret == -1 {
            return Err(errno!("failed to connect to {ip}:{port}"));
        }
        Ok(())
    }

    /// Accepts one pending connection, returning its descriptor. With no
    /// pending connection on a non-blocking socket this fails with a
    /// would-block error.
    pub fn accept(&self) -> Result<RawFd> {
        let fd = unsafe { libc::accept(self.fd(), std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd == -1 {
            return Err(errno!("failed to accept connection"));
        }
        Ok(fd)
    }

    /// Non-blocking receive into `buf`.
    ///
    /// Returns `Ok(0)` for would-block and interrupts; the caller retries on
    /// the next readiness notification. Note that a peer's orderly close
    /// also surfaces as `Ok(0)` here; hangup readiness reports it to the
    /// reactor separately.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = unsafe {
            libc::recv(
                self.fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if n == -1 {
            let err = std::io::Error::last_os_error();
            return match err.kind() {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => Ok(0),
                _ => Err(errno!("failed to recv on fd {}", self.fd())),
            };
        }
        Ok(n as usize)
    }

    /// Non-blocking send from `buf`, returning the number of bytes actually
    /// written. `Ok(0)` means would-block or interrupt; short writes are
    /// expected and the caller keeps the remainder buffered.
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = unsafe {
            libc::send(
                self.fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if n == -1 {
            let err = std::io::Error::last_os_error();
            return match err.kind() {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => Ok(0),
                _ => Err(errno!("failed to send on fd {}", self.fd())),
            };
        }
        Ok(n as usize)
    }

    /// Closes the descriptor. Safe to call more than once; later calls are
    /// no-ops.
    pub fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::Relaxed);
        if fd >= 0 {
            unsafe {
                let _ = libc::close(fd);
            }
        }
    }

    /// Switches the descriptor to non-blocking mode.
    pub fn set_nonblocking(&self) -> Result<()> {
        unsafe {
            let flags = libc::fcntl(self.fd(), libc::F_GETFL, 0);
            if flags == -1 {
                return Err(errno!("failed to get socket flags"));
            }
            if libc::fcntl(self.fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
                return Err(errno!("failed to set socket non-blocking"));
            }
        }
        Ok(())
    }

    /// Enables `SO_REUSEADDR` and `SO_REUSEPORT`.
    pub fn reuse_addr(&self) -> Result<()> {
        let opt: libc::c_int = 1;
        for name in [libc::SO_REUSEADDR, libc::SO_REUSEPORT] {
            let ret = unsafe {
                libc::setsockopt(
                    self.fd(),
                    libc::SOL_SOCKET,
                    name,
                    &raw const opt as *const libc::c_void,
                    mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if ret == -1 {
                return Err(errno!("failed to set socket reuse option {name}"));
            }
        }
        Ok(())
    }

    /// The locally bound port, via `getsockname`.
    pub fn local_port(&self) -> Result<u16> {
        unsafe {
            let mut addr: libc::sockaddr_in = mem::zeroed();
            let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let ret = libc::getsockname(
                self.fd(),
                &raw mut addr as *mut libc::sockaddr,
                &raw mut len,
            );
            if ret == -1 {
                return Err(errno!("failed to get socket name"));
            }
            Ok(u16::from_be(addr.sin_port))
        }
    }

    /// Builds a reusable listening socket on `0.0.0.0:port`, non-blocking
    /// when `nonblocking` is set.
    pub fn create_server(port: u16, nonblocking: bool) -> Result<Self> {
        let socket = Socket::new()?;
        socket.reuse_addr()?;
        socket.bind(Ipv4Addr::UNSPECIFIED, port)?;
        socket.listen(DEFAULT_BACKLOG)?;
        if nonblocking {
            socket.set_nonblocking()?;
        }
        Ok(socket)
    }

    /// Builds a socket connected to `ip:port`.
    pub fn create_client(ip: Ipv4Addr, port: u16) -> Result<Self> {
        let socket = Socket::new()?;
        socket.connect(ip, port)?;
        Ok(socket)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

fn sockaddr_in(ip: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr = libc::in_addr {
        s_addr: u32::from(ip).to_be(),
    };
    addr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_socket_binds_an_ephemeral_port() {
        let socket = Socket::create_server(0, true).unwrap();
        assert!(socket.local_port().unwrap() > 0);
    }

    #[test]
    fn nonblocking_accept_reports_would_block() {
        let socket = Socket::create_server(0, true).unwrap();
        let err = socket.accept().unwrap_err();
        let crate::Error::Io(err) = err;
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn close_is_idempotent() {
        let socket = Socket::new().unwrap();
        socket.close();
        socket.close();
        assert_eq!(socket.fd(), -1);
    }

    #[test]
    fn loopback_recv_and_send() {
        let server = Socket::create_server(0, true).unwrap();
        let port = server.local_port().unwrap();

        let client = Socket::create_client(Ipv4Addr::LOCALHOST, port).unwrap();

        // The connection is pending on the listener by the time connect
        // returned, but give the accept a few tries to be safe.
        let mut accepted = None;
        for _ in 0..50 {
            match server.accept() {
                Ok(fd) => {
                    accepted = Some(Socket::from_fd(fd));
                    break;
                }
                Err(_) => std::thread::sleep(std::time::Duration::from_millis(10)),
            }
        }
        let accepted = accepted.expect("listener never saw the connection");

        assert_eq!(client.send(b"hello").unwrap(), 5);

        let mut buf = [0u8; 16];
        let mut n = 0;
        for _ in 0..50 {
            n = accepted.recv(&mut buf).unwrap();
            if n > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(&buf[..n], b"hello");
    }
}
