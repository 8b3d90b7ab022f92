//! Multi-loop TCP server tying the acceptor, worker pool, and connection
//! registry together.

use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::info;
use crate::net::{Acceptor, Connection, ConnectionCallback, MessageCallback};
use crate::reactor::{EventLoop, LoopThreadPool};
use crate::Result;

#[derive(Default)]
struct ServerCallbacks {
    connected: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    close: Option<ConnectionCallback>,
    event: Option<ConnectionCallback>,
}

/// State reachable from the accept path and from connection teardown, which
/// runs on worker threads.
struct ServerShared {
    next_id: AtomicU64,
    // Idle timeout in ticks; zero disables the idle timer entirely.
    inactive_timeout: AtomicU64,
    pool: LoopThreadPool,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    callbacks: Mutex<ServerCallbacks>,
}

/// A TCP server multiplexing connections across a base loop and an optional
/// set of worker loops.
///
/// The server owns the event loop of the thread that created it; that loop
/// accepts connections and holds the registry, while connection I/O is
/// distributed round-robin over the workers. [TcpServer::start] never
/// returns.
pub struct TcpServer {
    event_loop: Rc<EventLoop>,
    acceptor: Acceptor,
    shared: Arc<ServerShared>,
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("port", &self.acceptor.port())
            .field(
                "connections",
                &self.shared.connections.lock().unwrap().len(),
            )
            .finish_non_exhaustive()
    }
}

impl TcpServer {
    /// Binds a listening socket on `port` and creates the base event loop on
    /// the calling thread. Pass port `0` to bind an ephemeral port, then
    /// recover it with [TcpServer::port].
    pub fn new(port: u16) -> Result<Self> {
        let event_loop = EventLoop::new()?;

        let shared = Arc::new(ServerShared {
            next_id: AtomicU64::new(1),
            inactive_timeout: AtomicU64::new(0),
            pool: LoopThreadPool::new(event_loop.handle()),
            connections: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(ServerCallbacks::default()),
        });

        let accept_shared = shared.clone();
        let acceptor = Acceptor::new(port, move |fd| {
            Self::on_accept(&accept_shared, fd);
        })?;

        Ok(TcpServer {
            event_loop,
            acceptor,
            shared,
        })
    }

    /// Port the listening socket is bound to.
    pub fn port(&self) -> Result<u16> {
        self.acceptor.port()
    }

    /// Installs the callback run once each connection is established.
    pub fn set_connected_callback(&self, cb: ConnectionCallback) {
        self.shared.callbacks.lock().unwrap().connected = Some(cb);
    }

    /// Installs the callback run when a connection has readable input.
    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.shared.callbacks.lock().unwrap().message = Some(cb);
    }

    /// Installs the callback run as each connection is torn down.
    pub fn set_close_callback(&self, cb: ConnectionCallback) {
        self.shared.callbacks.lock().unwrap().close = Some(cb);
    }

    /// Installs the callback run on every readiness cycle of a connection.
    pub fn set_event_callback(&self, cb: ConnectionCallback) {
        self.shared.callbacks.lock().unwrap().event = Some(cb);
    }

    /// Closes connections that stay idle for `timeout` ticks. Applies to
    /// connections accepted after this call.
    pub fn enable_inactive_release(&self, timeout: u64) {
        self.shared
            .inactive_timeout
            .store(timeout, Ordering::Relaxed);
    }

    /// Schedules `action` on the base loop after `timeout` ticks, returning
    /// the timer's task id. Ids are drawn from the same counter as
    /// connection ids, so a server timer can never collide with a
    /// connection's idle timer on the base loop's wheel.
    pub fn run_after(&self, timeout: u64, action: impl FnOnce() + 'static) -> u64 {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.event_loop.run_after(id, timeout, action);
        id
    }

    /// Number of connections currently established.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().unwrap().len()
    }

    /// Spawns `workers` worker loops, begins accepting, and runs the base
    /// loop on the calling thread forever. With zero workers all connection
    /// I/O shares the base loop.
    pub fn start(&self, workers: usize) -> ! {
        self.shared.pool.start(workers);
        self.acceptor.listen(&self.event_loop);

        match self.port() {
            Ok(port) => info!("server listening on port {port} with {workers} worker loop(s)"),
            Err(_) => info!("server listening with {workers} worker loop(s)"),
        }

        self.event_loop.start()
    }

    /// Runs on the base loop for every accepted descriptor: picks a worker,
    /// wires the connection up, registers it, and establishes it.
    fn on_accept(shared: &Arc<ServerShared>, fd: RawFd) {
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = shared.pool.next_loop();
        let conn = Connection::new(handle, id, fd);

        {
            let callbacks = shared.callbacks.lock().unwrap();
            if let Some(cb) = callbacks.connected.clone() {
                conn.set_connected_callback(cb);
            }
            if let Some(cb) = callbacks.message.clone() {
                conn.set_message_callback(cb);
            }
            if let Some(cb) = callbacks.close.clone() {
                conn.set_close_callback(cb);
            }
            if let Some(cb) = callbacks.event.clone() {
                conn.set_event_callback(cb);
            }
        }

        // Teardown runs on the worker thread; registry removal is marshaled
        // back to the base loop (the registry's owning thread).
        let close_shared = shared.clone();
        let base = EventLoop::current().handle();
        conn.set_server_close_callback(Arc::new(move |conn| {
            let id = conn.id();
            let registry = close_shared.clone();
            base.run_in_loop(move || {
                registry.connections.lock().unwrap().remove(&id);
            });
        }));

        shared.connections.lock().unwrap().insert(id, conn.clone());

        let timeout = shared.inactive_timeout.load(Ordering::Relaxed);
        if timeout > 0 {
            conn.enable_inactivity_release(timeout);
        }
        conn.establish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Socket;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Polls a `MSG_DONTWAIT` socket until data arrives or the deadline
    /// passes.
    fn recv_blocking(socket: &Socket, buf: &mut [u8], deadline: Duration) -> usize {
        let start = Instant::now();
        loop {
            let n = socket.recv(buf).unwrap();
            if n > 0 {
                return n;
            }
            assert!(start.elapsed() < deadline, "timed out waiting for data");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        done()
    }

    #[test]
    fn echoes_across_loops() {
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            let server = TcpServer::new(0).unwrap();
            server.set_message_callback(Arc::new(|conn, input| {
                let msg = input.read_as_string(input.readable_size(), true);
                conn.send(msg.as_bytes());
            }));
            tx.send(server.port().unwrap()).unwrap();
            server.start(1);
        });

        let port = rx.recv().unwrap();
        let client = Socket::create_client(Ipv4Addr::LOCALHOST, port).unwrap();
        client.send(b"hello reactor").unwrap();

        let mut buf = [0u8; 64];
        let n = recv_blocking(&client, &mut buf, Duration::from_secs(5));
        assert_eq!(&buf[..n], b"hello reactor");
    }

    #[test]
    fn distributes_connections_round_robin() {
        let (tx, rx) = mpsc::channel();
        let threads = Arc::new(Mutex::new(Vec::new()));

        let seen = threads.clone();
        thread::spawn(move || {
            let server = TcpServer::new(0).unwrap();
            server.set_connected_callback(Arc::new(move |_| {
                seen.lock().unwrap().push(thread::current().id());
            }));
            tx.send(server.port().unwrap()).unwrap();
            server.start(2);
        });

        let port = rx.recv().unwrap();
        let _clients: Vec<_> = (0..3)
            .map(|_| Socket::create_client(Ipv4Addr::LOCALHOST, port).unwrap())
            .collect();

        assert!(wait_until(Duration::from_secs(5), || {
            threads.lock().unwrap().len() == 3
        }));

        // Callback order across workers is not deterministic, so the
        // worker0/worker1/worker0 assignment order itself is asserted at the
        // pool level (`round_robin_wraps_around`). Here assert the resulting
        // distribution: two distinct workers, one carrying two of the three
        // connections.
        let ids = threads.lock().unwrap().clone();
        let distinct: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(distinct.len(), 2);
        assert!(distinct
            .iter()
            .any(|id| ids.iter().filter(|i| i == id).count() == 2));
    }

    #[test]
    fn timer_ids_never_collide_with_connection_ids() {
        let (tx, rx) = mpsc::channel();
        let (conn_tx, conn_rx) = mpsc::channel();

        thread::spawn(move || {
            let server = TcpServer::new(0).unwrap();
            server.enable_inactive_release(30);

            let conn_tx = Mutex::new(conn_tx);
            server.set_connected_callback(Arc::new(move |conn| {
                conn_tx.lock().unwrap().send(conn.id()).unwrap();
            }));

            let first = server.run_after(10, || {});
            let second = server.run_after(10, || {});
            tx.send((server.port().unwrap(), first, second)).unwrap();
            server.start(0);
        });

        let (port, first, second) = rx.recv().unwrap();
        let _client = Socket::create_client(Ipv4Addr::LOCALHOST, port).unwrap();
        let conn_id = conn_rx.recv().unwrap();

        // Timer tasks and connections draw from one id counter. A reused id
        // would overwrite the wheel's lookup entry, leaving refreshes and
        // cancels aimed at the wrong task while the displaced one still
        // fires at its original deadline.
        assert_ne!(first, second);
        assert_ne!(conn_id, first);
        assert_ne!(conn_id, second);
    }

    #[test]
    fn idle_connections_are_released() {
        let (tx, rx) = mpsc::channel();
        let closed = Arc::new(AtomicUsize::new(0));

        let hits = closed.clone();
        thread::spawn(move || {
            let server = TcpServer::new(0).unwrap();
            server.enable_inactive_release(2);
            server.set_close_callback(Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
            tx.send(server.port().unwrap()).unwrap();
            server.start(0);
        });

        let port = rx.recv().unwrap();
        let _client = Socket::create_client(Ipv4Addr::LOCALHOST, port).unwrap();

        // The wheel ticks once per second; two idle ticks must close us.
        assert!(wait_until(Duration::from_secs(6), || {
            closed.load(Ordering::SeqCst) == 1
        }));
    }
}
