//! Turns readiness on the listening descriptor into accepted connections.

use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::net::Socket;
use crate::reactor::{Channel, EventLoop};
use crate::{Error, Result, warn};

/// Listening socket plus the channel that watches it on the base loop.
///
/// One readiness notification accepts exactly one pending connection; a
/// burst of simultaneous arrivals is spread over successive reactor cycles.
pub struct Acceptor {
    socket: Rc<Socket>,
    channel: Rc<Channel>,
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("fd", &self.socket.fd())
            .finish_non_exhaustive()
    }
}

impl Acceptor {
    /// Binds a non-blocking listener on `port` (0 picks an ephemeral port)
    /// and wires `on_accept` to its read readiness. The channel stays
    /// unregistered until [Acceptor::listen].
    pub fn new(port: u16, on_accept: impl Fn(RawFd) + 'static) -> Result<Self> {
        let socket = Rc::new(Socket::create_server(port, true)?);
        let channel = Channel::new(socket.fd());

        let listener = socket.clone();
        channel.set_read_callback(Box::new(move || match listener.accept() {
            Ok(fd) => on_accept(fd),
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => warn!("accept failed: {err}"),
        }));

        Ok(Acceptor { socket, channel })
    }

    /// Subscribes the listening descriptor to read readiness on the base
    /// loop, which starts the flow of accepted connections.
    pub fn listen(&self, event_loop: &Rc<EventLoop>) {
        self.channel.enable_read(event_loop);
    }

    /// The port the listener is bound to.
    pub fn port(&self) -> Result<u16> {
        self.socket.local_port()
    }
}
